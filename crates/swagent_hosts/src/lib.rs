pub mod clause;
pub mod hosts;
mod xml;

use anyhow::{bail, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use swagent_boss::Boss;
use swagent_model::PropTree;
use swagent_terminal::FullMatch;

/// One device-family handler: a single dispatch point fed semantic commands
/// from the boss loop. Handlers open their terminal lazily on first need and
/// may cache expensive fetches for the life of the session; `close` runs
/// once at session end and flushes anything pending (the JunOS candidate
/// commit).
#[async_trait]
pub trait Host: Send {
    async fn execute(&mut self, boss: &mut Boss, cmd: &str, args: &str) -> Result<()>;

    async fn close(&mut self, _boss: &mut Boss) -> Result<()> {
        Ok(())
    }
}

static VLAN_ID: Lazy<FullMatch> = Lazy::new(|| FullMatch::new("[0-9]{1,4}").expect("vlan id"));

/// VLAN-taking commands require a 1-4 digit identifier argument.
pub(crate) fn require_vlan_id(args: &str) -> Result<()> {
    if args.is_empty() {
        bail!("Must provide a VLAN to show");
    }
    if !VLAN_ID.is_match(args) {
        bail!("Invalid vlan ID: {args}");
    }
    Ok(())
}

/// A modification sequence reports `success` only when no step accumulated
/// an error; the two are mutually exclusive on the emitted `result` tree.
pub(crate) fn mark_success(result: &mut PropTree) {
    if !result.child_exists("errors") {
        result.at("success").set_data("1");
    }
}

type HostCtor = fn(PropTree) -> Box<dyn Host>;

pub struct HostRegistry {
    entries: Vec<(&'static str, HostCtor)>,
}

impl HostRegistry {
    pub fn builtin() -> Self {
        HostRegistry {
            entries: vec![
                ("ciscoios", |phost| Box::new(hosts::CiscoIos::new(phost))),
                ("junosswitch", |phost| Box::new(hosts::JunosSwitch::new(phost))),
                ("calixeseries", |phost| {
                    Box::new(hosts::CalixESeries::new(phost))
                }),
                ("calixaeont", |phost| Box::new(hosts::CalixAeOnt::new(phost))),
                ("airos", |phost| Box::new(hosts::AirOs::new(phost))),
            ],
        }
    }

    pub fn construct(&self, phost: &PropTree) -> Result<Box<dyn Host>> {
        let tag = phost.child_data("type");
        match self.entries.iter().find(|(name, _)| *name == tag) {
            Some((_, ctor)) => Ok(ctor(phost.clone())),
            None => bail!("No function library for switch type '{tag}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_every_family() {
        let registry = HostRegistry::builtin();
        for tag in ["ciscoios", "junosswitch", "calixeseries", "calixaeont", "airos"] {
            let mut phost = PropTree::new();
            phost.at("type").set_data(tag);
            assert!(registry.construct(&phost).is_ok(), "missing family {tag}");
        }
    }

    #[test]
    fn unknown_family_is_reported_by_tag() {
        let registry = HostRegistry::builtin();
        let mut phost = PropTree::new();
        phost.at("type").set_data("nope");
        let err = match registry.construct(&phost) {
            Ok(_) => panic!("must fail"),
            Err(e) => e,
        };
        assert_eq!(
            format!("{err}"),
            "No function library for switch type 'nope'"
        );
    }

    #[test]
    fn missing_type_reports_empty_tag() {
        let registry = HostRegistry::builtin();
        let err = match registry.construct(&PropTree::new()) {
            Ok(_) => panic!("must fail"),
            Err(e) => e,
        };
        assert_eq!(format!("{err}"), "No function library for switch type ''");
    }

    #[test]
    fn vlan_ids_are_validated_before_any_device_traffic() {
        assert!(require_vlan_id("1").is_ok());
        assert!(require_vlan_id("4094").is_ok());
        let err = require_vlan_id("").expect_err("empty");
        assert_eq!(format!("{err}"), "Must provide a VLAN to show");
        let err = require_vlan_id("abc").expect_err("letters");
        assert_eq!(format!("{err}"), "Invalid vlan ID: abc");
        let err = require_vlan_id("12345").expect_err("too long");
        assert_eq!(format!("{err}"), "Invalid vlan ID: 12345");
    }
}
