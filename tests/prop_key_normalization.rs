// Property: cache keys ignore the cache-busting parameter and fragments while
// keeping every other query parameter.

use proptest::prelude::*;
use reqwest::Url;
use tile_proxy::KeyNormalizer;

fn normalizer() -> KeyNormalizer {
    KeyNormalizer::new(Url::parse("https://app.example.com").unwrap(), "v")
}

fn query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_buster_value_does_not_change_key(
        path in "/[a-z]{1,8}(/[a-z0-9]{1,8}){0,3}",
        params in proptest::collection::vec(("[a-u]{1,6}", "[a-zA-Z0-9]{0,8}"), 0..4),
        buster_a in "[a-zA-Z0-9]{1,12}",
        buster_b in "[a-zA-Z0-9]{1,12}",
    ) {
        let base = query(&params);
        let with = |buster: &str| {
            let q = if base.is_empty() {
                format!("v={}", buster)
            } else {
                format!("{}&v={}", base, buster)
            };
            Url::parse(&format!("https://app.example.com{}?{}", path, q)).unwrap()
        };
        let without = if base.is_empty() {
            Url::parse(&format!("https://app.example.com{}", path)).unwrap()
        } else {
            Url::parse(&format!("https://app.example.com{}?{}", path, base)).unwrap()
        };

        let n = normalizer();
        let a = n.normalize(&with(&buster_a)).unwrap();
        let b = n.normalize(&with(&buster_b)).unwrap();
        let c = n.normalize(&without).unwrap();

        prop_assert_eq!(&a, &b);
        prop_assert_eq!(&a, &c);
        prop_assert!(a.url().query_pairs().all(|(name, _)| name != "v"));
        prop_assert_eq!(a.url().query_pairs().count(), params.len());
    }

    #[test]
    fn prop_fragment_does_not_change_key(
        path in "/[a-z]{1,8}",
        fragment in "[a-zA-Z0-9]{1,12}",
    ) {
        let n = normalizer();
        let plain = Url::parse(&format!("https://app.example.com{}", path)).unwrap();
        let with_fragment =
            Url::parse(&format!("https://app.example.com{}#{}", path, fragment)).unwrap();
        prop_assert_eq!(n.normalize(&plain), n.normalize(&with_fragment));
    }

    #[test]
    fn prop_other_hosts_have_no_key(
        host in "[a-z]{1,10}\\.example\\.net",
        path in "/[a-z]{1,8}",
    ) {
        let url = Url::parse(&format!("https://{}{}", host, path)).unwrap();
        prop_assert!(normalizer().normalize(&url).is_none());
    }
}
