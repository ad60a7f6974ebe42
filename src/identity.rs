//! Canonical actor identity resolution
//!
//! A device id other than zero always identifies the actor. Web traffic falls
//! back to the network address, but only where the address column can be
//! trusted: NAT egress points and carrier gateways collapse thousands of users
//! onto one address, and flagging that address would flag them all. The audit
//! measures address quality per media scope once, then every lookup is O(1).

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::{AddressPolicy, IdentityConfig};
use crate::types::{ActorKey, ClickEvent, Settlement};

/// Address-quality measurements for one media scope.
#[derive(Debug, Clone, Copy)]
pub struct AddressQuality {
    pub rows: usize,
    pub distinct: usize,
    pub top_share: f64,
    pub reliable: bool,
}

/// Resolves rows to actor identities under the configured fallback policy.
pub struct IdentityResolver {
    policy: AddressPolicy,
    infrastructure_prefixes: Vec<String>,
    quality: HashMap<i64, AddressQuality>,
}

impl IdentityResolver {
    /// Audit address quality per media scope and build the resolver.
    pub fn audit(config: &IdentityConfig, events: &[ClickEvent]) -> Self {
        let mut per_media: HashMap<i64, HashMap<&str, usize>> = HashMap::new();
        for e in events {
            if let Some(addr) = e.address.as_deref() {
                *per_media
                    .entry(e.media_id)
                    .or_default()
                    .entry(addr)
                    .or_insert(0) += 1;
            }
        }

        let mut quality = HashMap::with_capacity(per_media.len());
        let mut unreliable = 0usize;
        for (media_id, counts) in per_media {
            let rows: usize = counts.values().sum();
            let distinct = counts.len();
            let top = counts.values().copied().max().unwrap_or(0);
            let top_share = top as f64 / rows as f64;
            let unique_ratio = distinct as f64 / rows as f64;

            // Small scopes never have enough evidence to be distrusted.
            let reliable = rows < config.unreliable_min_rows
                || (top_share < config.unreliable_top_share
                    && unique_ratio > config.unreliable_unique_ratio);
            if !reliable {
                unreliable += 1;
                debug!(media_id, rows, distinct, top_share, "address scope judged unreliable");
            }
            quality.insert(
                media_id,
                AddressQuality {
                    rows,
                    distinct,
                    top_share,
                    reliable,
                },
            );
        }

        info!(
            scopes = quality.len(),
            unreliable,
            policy = ?config.policy,
            "identity audit complete"
        );

        Self {
            policy: config.policy,
            infrastructure_prefixes: config.infrastructure_prefixes.clone(),
            quality,
        }
    }

    /// True for addresses belonging to known infrastructure ranges. These are
    /// shared egress points, never user identities.
    pub fn is_infrastructure(&self, addr: &str) -> bool {
        if self
            .infrastructure_prefixes
            .iter()
            .any(|p| addr.starts_with(p.as_str()))
        {
            return true;
        }
        // 172.16.0.0/12 needs a second-octet range check
        if let Some(rest) = addr.strip_prefix("172.") {
            if let Some(octet) = rest.split('.').next() {
                if let Ok(n) = octet.parse::<u16>() {
                    return (16..=31).contains(&n);
                }
            }
        }
        false
    }

    /// Whether the address column may identify actors within this media scope.
    pub fn address_usable(&self, media_id: i64) -> bool {
        match self.policy {
            AddressPolicy::Always => true,
            AddressPolicy::Never => false,
            // Scopes absent from the audit carried no addresses at all, so
            // nothing distrusts them; treat as reliable.
            AddressPolicy::Guarded => self.quality.get(&media_id).map_or(true, |q| q.reliable),
        }
    }

    fn resolve(&self, device_id: i64, media_id: i64, address: Option<&str>) -> Option<ActorKey> {
        if device_id != 0 {
            return Some(ActorKey::Device(device_id));
        }
        let addr = address?;
        if self.is_infrastructure(addr) || !self.address_usable(media_id) {
            return None;
        }
        Some(ActorKey::Address(addr.to_string()))
    }

    pub fn actor_for_event(&self, e: &ClickEvent) -> Option<ActorKey> {
        self.resolve(e.device_id, e.media_id, e.address.as_deref())
    }

    pub fn actor_for_settlement(&self, s: &Settlement) -> Option<ActorKey> {
        self.resolve(s.device_id, s.media_id.unwrap_or(-1), s.address.as_deref())
    }

    /// Share of audited scopes whose address column is reliable. Drives the
    /// fan graph's auto mode.
    pub fn reliable_share(&self) -> f64 {
        if self.quality.is_empty() {
            return 0.0;
        }
        let reliable = self.quality.values().filter(|q| q.reliable).count();
        reliable as f64 / self.quality.len() as f64
    }

    pub fn quality_for(&self, media_id: i64) -> Option<&AddressQuality> {
        self.quality.get(&media_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(device_id: i64, media_id: i64, address: Option<&str>) -> ClickEvent {
        ClickEvent {
            click_key: "ck".to_string(),
            campaign_id: 1,
            media_id,
            publisher_id: 1,
            device_id,
            address: address.map(|s| s.to_string()),
            clicked_at: None,
        }
    }

    fn resolver_with(events: &[ClickEvent]) -> IdentityResolver {
        IdentityResolver::audit(&IdentityConfig::default(), events)
    }

    #[test]
    fn test_device_id_always_wins() {
        let resolver = resolver_with(&[]);
        let e = event(42, 1, Some("1.2.3.4"));
        assert_eq!(resolver.actor_for_event(&e), Some(ActorKey::Device(42)));
    }

    #[test]
    fn test_unreliable_scope_blocks_address_fallback() {
        // 250 rows, one address holding 99% of them: unreliable
        let mut events: Vec<ClickEvent> = (0..248).map(|_| event(0, 7, Some("9.9.9.9"))).collect();
        events.push(event(0, 7, Some("9.9.9.8")));
        events.push(event(0, 7, Some("9.9.9.7")));
        let resolver = resolver_with(&events);

        assert!(!resolver.address_usable(7));
        assert_eq!(resolver.actor_for_event(&events[0]), None);
        let quality = resolver.quality_for(7).unwrap();
        assert!(!quality.reliable);
        assert_eq!(quality.rows, 250);
        assert_eq!(quality.distinct, 3);
        // device rows in the same scope still resolve
        let with_device = event(5, 7, Some("9.9.9.9"));
        assert_eq!(
            resolver.actor_for_event(&with_device),
            Some(ActorKey::Device(5))
        );
    }

    #[test]
    fn test_small_scope_is_trusted() {
        // Below the row floor the same concentration is not enough evidence
        let events: Vec<ClickEvent> = (0..50).map(|_| event(0, 3, Some("8.8.8.8"))).collect();
        let resolver = resolver_with(&events);
        assert!(resolver.address_usable(3));
        assert_eq!(
            resolver.actor_for_event(&events[0]),
            Some(ActorKey::Address("8.8.8.8".to_string()))
        );
    }

    #[test]
    fn test_infrastructure_prefixes_never_identify() {
        let resolver = resolver_with(&[]);
        assert!(resolver.is_infrastructure("10.0.0.1"));
        assert!(resolver.is_infrastructure("43.203.11.2"));
        assert!(resolver.is_infrastructure("172.16.0.1"));
        assert!(resolver.is_infrastructure("172.31.255.1"));
        assert!(!resolver.is_infrastructure("172.32.0.1"));
        assert!(!resolver.is_infrastructure("172.8.0.1"));

        let e = event(0, 1, Some("192.168.1.10"));
        assert_eq!(resolver.actor_for_event(&e), None);
    }

    #[test]
    fn test_never_policy_is_device_only() {
        let config = IdentityConfig {
            policy: AddressPolicy::Never,
            ..IdentityConfig::default()
        };
        let resolver = IdentityResolver::audit(&config, &[]);
        let e = event(0, 1, Some("1.2.3.4"));
        assert_eq!(resolver.actor_for_event(&e), None);
    }

    #[test]
    fn test_reliable_share() {
        let mut events: Vec<ClickEvent> =
            (0..300).map(|_| event(0, 1, Some("9.9.9.9"))).collect();
        for i in 0..300 {
            events.push(event(0, 2, Some(&format!("7.7.{}.{}", i / 250, i % 250))));
        }
        let resolver = resolver_with(&events);
        assert!((resolver.reliable_share() - 0.5).abs() < 1e-9);
    }
}
