use std::sync::Arc;
use wa_inbox::db::{self, ConversationStore};
use wa_inbox::identity::{canonicalize, normalize_phone, IdentityResolver, PhoneFormat};
use wa_inbox::types::{Address, CanonicalAddress};

fn br() -> PhoneFormat {
    PhoneFormat {
        country_code: "55".to_string(),
        default_area_code: Some("11".to_string()),
    }
}

async fn resolver() -> (IdentityResolver, Arc<dyn ConversationStore>) {
    let store: Arc<dyn ConversationStore> = Arc::new(db::connect("sqlite::memory:").await.unwrap());
    (IdentityResolver::new(store.clone(), br()), store)
}

#[test]
fn test_format_convergence() {
    // Subscriber only, area + 8-digit subscriber, and the modern 9-digit mobile form.
    let forms = ["5599998888", "551199998888", "5511999998888"];
    let canonical: Vec<String> = forms.iter().map(|f| normalize_phone(f, &br())).collect();
    assert!(canonical.iter().all(|c| c == "5511999998888"), "{canonical:?}");
}

#[test]
fn test_legacy_and_modern_forms_share_canonical() {
    let modern = canonicalize(&Address::parse("5541991188909"), &br());
    let legacy = canonicalize(&Address::parse("554191188909@s.whatsapp.net"), &br());
    assert_eq!(modern, legacy);
    assert_eq!(modern.as_str(), "5541991188909");
}

#[test]
fn test_normalization_is_idempotent() {
    for raw in ["5599998888", "554191188909", "551133334444", "14155550100"] {
        let once = normalize_phone(raw, &br());
        assert_eq!(normalize_phone(&once, &br()), once);
    }
}

#[test]
fn test_other_country_code() {
    let format = PhoneFormat {
        country_code: "1".to_string(),
        default_area_code: None,
    };
    assert_eq!(normalize_phone("5541991188909", &format), "5541991188909");
}

#[tokio::test]
async fn test_resolve_stable_address() {
    let (resolver, _) = resolver().await;
    let resolution = resolver
        .resolve("main", "554191188909:3@s.whatsapp.net", None)
        .await;
    assert_eq!(resolution.canonical.as_str(), "5541991188909");
    assert!(resolution.linked_alias.is_none());
    assert!(resolution.ambiguity.is_none());
}

#[tokio::test]
async fn test_unknown_alias_used_as_is() {
    let (resolver, _) = resolver().await;
    let resolution = resolver.resolve("main", "98765@lid", None).await;
    assert_eq!(resolution.canonical.as_str(), "98765@lid");
    assert!(!resolution.newly_linked);
}

#[tokio::test]
async fn test_alias_learned_then_substituted() {
    let (resolver, store) = resolver().await;

    let first = resolver
        .resolve("main", "98765@lid", Some("5511999998888@s.whatsapp.net"))
        .await;
    assert_eq!(first.canonical.as_str(), "5511999998888");
    assert_eq!(first.linked_alias, Some(CanonicalAddress::new("98765@lid")));
    assert!(first.newly_linked);

    let again = resolver
        .resolve("main", "5511999998888@s.whatsapp.net", Some("98765@lid"))
        .await;
    assert!(!again.newly_linked);

    let later = resolver.resolve("main", "98765@lid", None).await;
    assert_eq!(later.canonical.as_str(), "5511999998888");

    // Mappings are per instance.
    let other = resolver.resolve("other", "98765@lid", None).await;
    assert_eq!(other.canonical.as_str(), "98765@lid");

    assert_eq!(store.list_aliases("main").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_group_address_not_linked() {
    let (resolver, store) = resolver().await;
    let resolution = resolver
        .resolve("main", "120363040000000000@g.us", Some("98765@lid"))
        .await;
    assert_eq!(resolution.canonical.as_str(), "120363040000000000@g.us");
    assert!(resolution.linked_alias.is_none());
    assert!(store.list_aliases("main").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lookup_alias_direct() {
    let (resolver, store) = resolver().await;
    store
        .upsert_alias("main", "111@lid", "5511999998888")
        .await
        .unwrap();
    let found = resolver
        .lookup_alias("main", &CanonicalAddress::new("111@lid"))
        .await
        .unwrap();
    assert_eq!(found, Some(CanonicalAddress::new("5511999998888")));
}
