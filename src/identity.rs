//! Maps raw gateway addresses to the canonical address used as the conversation key.
//!
//! Two steps, in order: an opaque alias is swapped for the stable address it was last
//! seen with, then stable addresses are rewritten into one national number format.

use crate::config::PhoneConfig;
use crate::db::ConversationStore;
use crate::error::ResolutionAmbiguity;
use crate::types::{Address, AddressKind, CanonicalAddress};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneFormat {
    pub country_code: String,
    pub default_area_code: Option<String>,
}

impl From<&PhoneConfig> for PhoneFormat {
    fn from(cfg: &PhoneConfig) -> Self {
        Self {
            country_code: cfg.country_code.trim().to_string(),
            default_area_code: cfg
                .default_area_code
                .as_ref()
                .map(|a| a.trim().to_string())
                .filter(|a| is_area_code(a)),
        }
    }
}

impl Default for PhoneFormat {
    fn default() -> Self {
        Self::from(&PhoneConfig::default())
    }
}

fn is_area_code(value: &str) -> bool {
    value.len() == 2 && value.chars().all(|c| ('1'..='9').contains(&c))
}

/// Mobile subscriber numbers start with 6-9; landlines (2-5) never gained the extra 9.
fn is_mobile_subscriber(subscriber: &str) -> bool {
    matches!(subscriber.chars().next(), Some('6'..='9'))
}

/// Rewrites a digits-only phone address into `country + area + 9-digit subscriber`.
///
/// Anything that does not fit the scheme is returned unchanged.
pub fn normalize_phone(digits: &str, format: &PhoneFormat) -> String {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return digits.to_string();
    }
    let cc = format.country_code.as_str();
    let Some(national) = digits.strip_prefix(cc).filter(|_| !cc.is_empty()) else {
        return digits.to_string();
    };

    match national.len() {
        // Subscriber only. The area code cannot be recovered, so this is a guess.
        8 => match format.default_area_code.as_deref() {
            Some(area) if is_mobile_subscriber(national) => format!("{cc}{area}9{national}"),
            _ => digits.to_string(),
        },
        9 if national.starts_with('9') && is_mobile_subscriber(&national[1..]) => {
            match format.default_area_code.as_deref() {
                Some(area) => format!("{cc}{area}{national}"),
                None => digits.to_string(),
            }
        }
        10 => {
            let (area, subscriber) = national.split_at(2);
            if is_area_code(area) && is_mobile_subscriber(subscriber) {
                format!("{cc}{area}9{subscriber}")
            } else {
                digits.to_string()
            }
        }
        _ => digits.to_string(),
    }
}

/// Canonical form of one address, without alias lookup.
pub fn canonicalize(address: &Address, format: &PhoneFormat) -> CanonicalAddress {
    match address.kind() {
        AddressKind::Stable => CanonicalAddress::new(normalize_phone(address.user(), format)),
        _ => CanonicalAddress::new(address.bare()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub canonical: CanonicalAddress,
    /// Opaque alias seen together with `canonical` in this event. Its conversation, if
    /// any, belongs to `canonical` now.
    pub linked_alias: Option<CanonicalAddress>,
    pub newly_linked: bool,
    pub ambiguity: Option<ResolutionAmbiguity>,
}

impl Resolution {
    fn plain(canonical: CanonicalAddress) -> Self {
        Self {
            canonical,
            linked_alias: None,
            newly_linked: false,
            ambiguity: None,
        }
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn ConversationStore>,
    format: PhoneFormat,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn ConversationStore>, format: PhoneFormat) -> Self {
        Self { store, format }
    }

    pub fn format(&self) -> &PhoneFormat {
        &self.format
    }

    /// Never fails: lookup errors degrade to the raw address and are reported as ambiguity.
    pub async fn resolve(&self, instance: &str, raw: &str, raw_alias: Option<&str>) -> Resolution {
        let primary = Address::parse(raw);
        let alias = raw_alias
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(Address::parse);

        if matches!(primary.kind(), AddressKind::Group | AddressKind::Broadcast) {
            return Resolution::plain(canonicalize(&primary, &self.format));
        }

        let (stable, opaque) = match alias.as_ref() {
            Some(other) if primary.is_stable() && other.is_opaque() => (Some(&primary), Some(other)),
            Some(other) if primary.is_opaque() && other.is_stable() => (Some(other), Some(&primary)),
            _ if primary.is_stable() => (Some(&primary), None),
            _ => (None, Some(&primary)),
        };

        match (stable, opaque) {
            (Some(stable), Some(opaque)) => self.link(instance, stable, opaque).await,
            (Some(stable), None) => Resolution::plain(canonicalize(stable, &self.format)),
            (None, Some(opaque)) => self.resolve_opaque(instance, opaque).await,
            (None, None) => Resolution::plain(canonicalize(&primary, &self.format)),
        }
    }

    /// Looks up the stable address last learned for an opaque alias.
    pub async fn lookup_alias(
        &self,
        instance: &str,
        alias: &CanonicalAddress,
    ) -> Result<Option<CanonicalAddress>, ResolutionAmbiguity> {
        self.store
            .find_alias(instance, alias.as_str())
            .await
            .map(|found| found.map(CanonicalAddress::new))
            .map_err(|err| ResolutionAmbiguity {
                address: alias.to_string(),
                reason: err.to_string(),
            })
    }

    async fn link(&self, instance: &str, stable: &Address, opaque: &Address) -> Resolution {
        let canonical = canonicalize(stable, &self.format);
        let alias = canonicalize(opaque, &self.format);
        match self
            .store
            .upsert_alias(instance, alias.as_str(), canonical.as_str())
            .await
        {
            Ok(newly_linked) => {
                if newly_linked {
                    info!(instance, alias = %alias, stable = %canonical, "learned alias mapping");
                }
                Resolution {
                    canonical,
                    linked_alias: Some(alias),
                    newly_linked,
                    ambiguity: None,
                }
            }
            Err(err) => {
                warn!(instance, alias = %alias, "could not record alias mapping: {err}");
                Resolution {
                    canonical,
                    linked_alias: Some(alias.clone()),
                    newly_linked: false,
                    ambiguity: Some(ResolutionAmbiguity {
                        address: alias.to_string(),
                        reason: err.to_string(),
                    }),
                }
            }
        }
    }

    async fn resolve_opaque(&self, instance: &str, opaque: &Address) -> Resolution {
        let alias = canonicalize(opaque, &self.format);
        match self.lookup_alias(instance, &alias).await {
            Ok(Some(stable)) => Resolution::plain(stable),
            Ok(None) => Resolution::plain(alias),
            Err(ambiguity) => {
                warn!(instance, alias = %alias, "alias lookup failed, using raw address: {}", ambiguity.reason);
                Resolution {
                    ambiguity: Some(ambiguity),
                    ..Resolution::plain(alias)
                }
            }
        }
    }
}
