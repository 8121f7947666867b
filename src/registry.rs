//! Global registry bookkeeping and the binding policy.
//!
//! The compositor advertises its globals as `(name, interface, version)`
//! tuples. A [`RegistryRouter`] records every advertisement, matches it
//! against an injected list of [`BindRule`]s and offers unclaimed tuples to a
//! [`GlobalObserver`]. The router itself never talks to the wire; the
//! dispatch state applies its decisions, which keeps the policy logic free of
//! protocol plumbing.

use std::collections::HashMap;

use tracing::{debug, warn};
use wayland_client::protocol::wl_registry::WlRegistry;
use wayland_client::QueueHandle;

/// The most recent advertisement recorded for a registry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalEntry {
    /// Interface string, e.g. `wl_output`.
    pub interface: String,
    /// Version advertised by the compositor.
    pub version: u32,
}

/// Observer for globals no bind rule claims.
///
/// Injected at bring-up. The default methods ignore everything, so callers
/// who only care about bound globals implement nothing.
pub trait GlobalObserver: Send {
    /// A global appeared that no rule claimed.
    fn global_added(&mut self, name: u32, interface: &str, version: u32) {
        let _ = (name, interface, version);
    }
    /// A previously advertised global disappeared.
    fn global_removed(&mut self, name: u32) {
        let _ = name;
    }
}

/// The do-nothing observer.
impl GlobalObserver for () {}

/// How one interface is bound when the compositor advertises it.
pub(crate) struct BindRule<S: 'static> {
    /// Interface this rule claims.
    pub interface: &'static str,
    /// Lowest protocol version the crate can drive.
    pub min_version: u32,
    /// Highest protocol version the crate understands.
    pub max_version: u32,
    /// Bring-up fails if no global was bound through this rule.
    pub required: bool,
    /// Performs the bind on the dispatch state.
    pub bind: fn(&mut S, &WlRegistry, &QueueHandle<S>, u32, u32),
    /// Invoked when a global bound through this rule is withdrawn.
    pub removed: Option<fn(&mut S, u32)>,
}

impl<S> std::fmt::Debug for BindRule<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindRule")
            .field("interface", &self.interface)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

struct RuleState<S: 'static> {
    rule: BindRule<S>,
    bound: Vec<u32>,
}

/// A matched rule, ready to apply.
pub(crate) struct Binding<S: 'static> {
    /// Copied out of the rule so the caller can invoke it on the dispatch
    /// state without borrowing the router.
    pub bind: fn(&mut S, &WlRegistry, &QueueHandle<S>, u32, u32),
    /// Negotiated version, the advertised version clamped to the rule's
    /// maximum.
    pub version: u32,
}

/// Binding table plus registration policy.
pub(crate) struct RegistryRouter<S: 'static> {
    globals: HashMap<u32, GlobalEntry>,
    rules: Vec<RuleState<S>>,
    observer: Box<dyn GlobalObserver>,
}

impl<S> std::fmt::Debug for RegistryRouter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryRouter")
            .field("globals", &self.globals)
            .field("rules", &self.rules.iter().map(|r| &r.rule).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<S> RegistryRouter<S> {
    pub(crate) fn new(rules: Vec<BindRule<S>>, observer: Box<dyn GlobalObserver>) -> RegistryRouter<S> {
        RegistryRouter {
            globals: HashMap::new(),
            rules: rules
                .into_iter()
                .map(|rule| RuleState { rule, bound: Vec::new() })
                .collect(),
            observer,
        }
    }

    /// Records an advertisement and decides whether to bind it.
    ///
    /// The table keeps the most recent advertisement per name. Tuples no
    /// rule claims go to the observer and `None` is returned.
    pub(crate) fn observe_global(&mut self, name: u32, interface: &str, version: u32) -> Option<Binding<S>> {
        debug!(name, interface, version, "global advertised");
        self.globals.insert(
            name,
            GlobalEntry {
                interface: interface.to_owned(),
                version,
            },
        );

        let Some(state) = self.rules.iter_mut().find(|s| s.rule.interface == interface) else {
            self.observer.global_added(name, interface, version);
            return None;
        };

        if version < state.rule.min_version {
            warn!(
                interface,
                version,
                minimum = state.rule.min_version,
                "compositor advertises an interface version below the supported minimum"
            );
            return None;
        }

        state.bound.push(name);
        Some(Binding {
            bind: state.rule.bind,
            version: version.min(state.rule.max_version),
        })
    }

    /// Handles a withdrawal.
    ///
    /// The table entry is kept so late queries still resolve; only the
    /// owning rule's removal hook (if any) and the observer are notified.
    pub(crate) fn observe_removal(&mut self, name: u32) -> Option<fn(&mut S, u32)> {
        debug!(name, "global removed");
        for state in &mut self.rules {
            if let Some(pos) = state.bound.iter().position(|&n| n == name) {
                state.bound.remove(pos);
                return state.rule.removed;
            }
        }
        self.observer.global_removed(name);
        None
    }

    /// The recorded advertisement for a name, if any was ever seen.
    pub(crate) fn global(&self, name: u32) -> Option<&GlobalEntry> {
        self.globals.get(&name)
    }

    /// Interfaces of required rules that never bound a global. Empty means
    /// bring-up may proceed.
    pub(crate) fn missing_required(&self) -> Vec<&'static str> {
        self.rules
            .iter()
            .filter(|s| s.rule.required && s.bound.is_empty())
            .map(|s| s.rule.interface)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Dummy;

    fn bind_noop(_: &mut Dummy, _: &WlRegistry, _: &QueueHandle<Dummy>, _: u32, _: u32) {}
    fn removed_noop(_: &mut Dummy, _: u32) {}

    fn rule(interface: &'static str, min: u32, max: u32, required: bool) -> BindRule<Dummy> {
        BindRule {
            interface,
            min_version: min,
            max_version: max,
            required,
            bind: bind_noop,
            removed: Some(removed_noop),
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        added: Arc<Mutex<Vec<(u32, String)>>>,
        removed: Arc<Mutex<Vec<u32>>>,
    }

    impl GlobalObserver for RecordingObserver {
        fn global_added(&mut self, name: u32, interface: &str, _version: u32) {
            self.added.lock().unwrap().push((name, interface.to_owned()));
        }
        fn global_removed(&mut self, name: u32) {
            self.removed.lock().unwrap().push(name);
        }
    }

    #[test]
    fn table_keeps_the_most_recent_advertisement_per_name() {
        let mut router: RegistryRouter<Dummy> = RegistryRouter::new(vec![], Box::new(()));
        router.observe_global(7, "wl_output", 2);
        router.observe_global(7, "wl_output", 3);
        assert_eq!(
            router.global(7),
            Some(&GlobalEntry {
                interface: "wl_output".into(),
                version: 3
            })
        );
    }

    #[test]
    fn removed_name_stays_queryable() {
        let mut router: RegistryRouter<Dummy> = RegistryRouter::new(vec![], Box::new(()));
        router.observe_global(4, "wl_seat", 5);
        router.observe_removal(4);
        assert_eq!(router.global(4).map(|e| e.interface.as_str()), Some("wl_seat"));
    }

    #[test]
    fn advertised_version_is_clamped_to_the_rule_maximum() {
        let mut router = RegistryRouter::new(vec![rule("wl_compositor", 1, 4, true)], Box::new(()));
        let binding = router.observe_global(1, "wl_compositor", 6).unwrap();
        assert_eq!(binding.version, 4);
    }

    #[test]
    fn version_below_minimum_is_not_bound() {
        let mut router = RegistryRouter::new(vec![rule("wl_output", 2, 3, true)], Box::new(()));
        assert!(router.observe_global(1, "wl_output", 1).is_none());
        assert_eq!(router.missing_required(), vec!["wl_output"]);
    }

    #[test]
    fn required_rules_report_missing_until_bound() {
        let mut router = RegistryRouter::new(
            vec![rule("wl_compositor", 1, 4, true), rule("wl_seat", 1, 5, false)],
            Box::new(()),
        );
        assert_eq!(router.missing_required(), vec!["wl_compositor"]);
        router.observe_global(1, "wl_compositor", 4);
        assert!(router.missing_required().is_empty());
    }

    #[test]
    fn unclaimed_tuples_reach_the_observer() {
        let observer = RecordingObserver::default();
        let added = observer.added.clone();
        let removed = observer.removed.clone();
        let mut router = RegistryRouter::new(vec![rule("wl_seat", 1, 5, false)], Box::new(observer));

        assert!(router.observe_global(9, "zwp_weird_thing_v1", 1).is_none());
        router.observe_removal(9);
        assert_eq!(*added.lock().unwrap(), vec![(9, "zwp_weird_thing_v1".to_owned())]);
        assert_eq!(*removed.lock().unwrap(), vec![9]);
    }

    #[test]
    fn removal_of_a_bound_global_returns_the_rule_hook() {
        let mut router = RegistryRouter::new(vec![rule("wl_seat", 1, 5, false)], Box::new(()));
        router.observe_global(3, "wl_seat", 5);
        assert!(router.observe_removal(3).is_some());
        // Second removal of the same name no longer matches the rule.
        assert!(router.observe_removal(3).is_none());
    }
}
