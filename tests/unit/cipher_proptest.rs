use proptest::prelude::*;
use sshproxy::error::ConfigurationError;
use sshproxy::ssh::cipher::{CipherSuite, SUPPORTED_CIPHERS};

fn supported_subset() -> impl Strategy<Value = Vec<String>> {
    Just(SUPPORTED_CIPHERS.to_vec())
        .prop_shuffle()
        .prop_flat_map(|names| {
            let len = names.len();
            (Just(names), 1..=len)
        })
        .prop_map(|(names, n)| names[..n].iter().map(|s| s.to_string()).collect())
}

proptest! {
    /// Any ordering of supported names is accepted and keeps its order.
    #[test]
    fn supported_subsets_keep_order(names in supported_subset()) {
        let suite = CipherSuite::new(names.clone()).unwrap();
        prop_assert_eq!(suite.names(), names.as_slice());
        prop_assert!(suite.first_unsupported().is_none());
        prop_assert_eq!(suite.to_string(), names.join(","));
    }

    /// The first unknown name is the one reported, wherever it sits.
    #[test]
    fn first_unknown_name_reported(
        names in supported_subset(),
        unknown in "[a-z]{3,8}-x[0-9]{2}",
        pos in 0usize..6,
    ) {
        let mut names = names;
        let pos = pos.min(names.len());
        names.insert(pos, unknown.clone());
        let suite = CipherSuite::new(names).unwrap();
        prop_assert_eq!(suite.first_unsupported(), Some(unknown.as_str()));
    }

    /// A repeated entry is rejected no matter where it appears.
    #[test]
    fn duplicates_rejected(names in supported_subset(), pick in any::<prop::sample::Index>()) {
        let mut names = names;
        let dup = pick.get(&names).clone();
        names.push(dup.clone());
        prop_assert_eq!(
            CipherSuite::new(names),
            Err(ConfigurationError::DuplicateCipher(dup))
        );
    }

    #[test]
    fn blank_entries_rejected(names in supported_subset(), blank in "[ \t]{0,4}") {
        let mut names = names;
        names.push(blank);
        prop_assert_eq!(CipherSuite::new(names), Err(ConfigurationError::BlankCipher));
    }
}
