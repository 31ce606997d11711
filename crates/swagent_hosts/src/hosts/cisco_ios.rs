use crate::clause::{parse_clauses, VlanClause};
use crate::{mark_success, require_vlan_id, Host};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use swagent_boss::Boss;
use swagent_model::PropTree;
use swagent_terminal::{snmp, FullMatch, Protocol, Terminal};
use tracing::info;

const REGEX_ROOT: &str = "[a-zA-Z0-9_-]+#";
const REGEX_CONFIG: &str = r"[a-zA-Z0-9_-]+\(config\)#";
const REGEX_CONFIG_IF: &str = r"[a-zA-Z0-9_-]+\(config-if\)#";
const REGEX_CONFIG_VLAN: &str = r"[a-zA-Z0-9_-]+\(config-vlan\)#";

const OID_IF_NAME: &str = ".1.3.6.1.2.1.31.1.1.1.1";
const OID_IF_ALIAS: &str = ".1.3.6.1.2.1.31.1.1.1.18";
const OID_IF_HIGH_SPEED: &str = ".1.3.6.1.2.1.31.1.1.1.15";
const OID_IF_OPER_STATUS: &str = ".1.3.6.1.2.1.2.2.1.8";
const OID_PAGP_GROUP: &str = ".1.3.6.1.4.1.9.9.98.1.1.1.1.8";

static IFACE_NAME: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r"(Fa|Gi|Po)[0-9]+(/[0-9]+)*").expect("iface name"));
static VLAN_NAME_LINE: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r"[0-9]{1,4} *(.*) active.*").expect("vlan name line"));
static VLAN_MEMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"((Gi|Fa|Po)[0-9]+(/[0-9]+)*)").expect("vlan member"));

/// Cisco IOS switch. Interface listing runs over SNMP; VLAN inspection and
/// modification run over the CLI, walking the privilege-mode prompts.
pub struct CiscoIos {
    phost: PropTree,
    term: Option<Terminal>,
}

impl CiscoIos {
    pub fn new(phost: PropTree) -> Self {
        CiscoIos { phost, term: None }
    }

    async fn terminal(&mut self) -> Result<&mut Terminal> {
        let term = match self.term.take() {
            Some(term) => term,
            None => Self::open_terminal(&self.phost).await?,
        };
        Ok(self.term.insert(term))
    }

    async fn open_terminal(phost: &PropTree) -> Result<Terminal> {
        let hostname = phost.child_data("hostname");
        let mut term = if phost.child_exists("proto-ssh") {
            let proto_ssh = phost.get("proto-ssh").cloned().unwrap_or_default();
            Terminal::connect(
                Protocol::Ssh,
                hostname,
                &proto_ssh,
                Some("[a-zA-Z0-9_-]+>"),
                Some(" --More-- "),
            )
            .await?
        } else {
            if !phost.child_exists("proto-telnet") {
                bail!("Must use -proto ssh or -proto telnet for a Cisco IOS switch");
            }
            let proto_telnet = phost.get("proto-telnet").cloned().unwrap_or_default();
            if proto_telnet.child_data("auth") != "console" {
                bail!("Only \"console\" auth type is supported for proto-telnet on Cisco IOS");
            }
            let mut term = Terminal::connect(
                Protocol::Telnet,
                hostname,
                &proto_telnet,
                Some(".?Password: "),
                Some(" --More-- "),
            )
            .await?;
            term.set_prompt("[a-zA-Z0-9_-]+>")?;
            term.execute(proto_telnet.child_data("password")).await?;
            term
        };

        let enable_secret = phost
            .get("proto-telnet")
            .map(|t| t.child_data("enable").to_string())
            .unwrap_or_default();
        if enable_secret.is_empty() {
            bail!("Must use -enable <secret> for Cisco IOS");
        }
        term.set_prompt("Password: ")?;
        term.execute("enable").await?;
        term.set_prompt(REGEX_ROOT)?;
        term.execute(&enable_secret)
            .await
            .map_err(|_| anyhow!("Timeout or invalid enable secret"))?;
        Ok(term)
    }

    async fn list_ifaces(&mut self, boss: &mut Boss) -> Result<()> {
        let community = self.phost.child_data("proto-snmp2").to_string();
        if community.is_empty() {
            bail!("Must supply an proto-snmp2 community string for Cisco IOS switch");
        }
        let ip = self.phost.child_data("hostname").to_string();
        if ip.is_empty() {
            bail!("Must supply a hostname or IP address for Cisco IOS switch");
        }

        let mut scan = IfaceScan::default();
        for (num, val) in snmp::bulk_walk(2, &community, &ip, OID_IF_NAME).await? {
            scan.on_name(&num, &val);
        }
        for (num, val) in snmp::bulk_walk(2, &community, &ip, OID_IF_ALIAS).await? {
            scan.on_alias(&num, &val);
        }
        for (num, val) in snmp::bulk_walk(2, &community, &ip, OID_IF_HIGH_SPEED).await? {
            scan.on_speed(&num, &val);
        }
        for (num, val) in snmp::bulk_walk(2, &community, &ip, OID_IF_OPER_STATUS).await? {
            scan.on_oper(&num, &val);
        }
        for (num, val) in snmp::bulk_walk(2, &community, &ip, OID_PAGP_GROUP).await? {
            scan.on_lag_group(&num, &val);
        }
        let ifaces = scan.finish();
        info!(target: "hosts::cisco_ios", interfaces = ifaces.len(), "list-ifaces done");
        boss.send_tree("interfaces", &ifaces).await
    }

    async fn get_vlan_info(&mut self, boss: &mut Boss, args: &str) -> Result<()> {
        require_vlan_id(args)?;
        let term = self.terminal().await?;
        let mut scan = VlanInfoScan::default();
        for line in term.execute(&format!("show vlan id {args}")).await? {
            scan.on_line(&line);
        }
        boss.send_tree("vlan", &scan.info).await
    }

    async fn mod_vlans(&mut self, boss: &mut Boss, args: &str) -> Result<()> {
        let clauses = parse_clauses(args);
        let term = self.terminal().await?;
        let mut result = PropTree::new();
        for clause in clauses {
            match clause {
                VlanClause::Create { id, name } | VlanClause::Rename { id, name } => {
                    term.set_prompt(REGEX_CONFIG)?;
                    term.execute("configure terminal").await?;
                    term.set_prompt(REGEX_CONFIG_VLAN)?;
                    collect_errors(&mut result, term.execute(&format!("vlan {id}")).await?);
                    collect_errors(&mut result, term.execute(&format!("name {name}")).await?);
                    term.set_prompt(REGEX_CONFIG)?;
                    collect_errors(&mut result, term.execute("exit").await?);
                    term.set_prompt(REGEX_ROOT)?;
                    collect_errors(&mut result, term.execute("exit").await?);
                }
                VlanClause::AddMembers { id, ifaces } => {
                    trunk_members(term, &mut result, &id, &ifaces, "add").await?;
                }
                VlanClause::RemoveMembers { id, ifaces } => {
                    trunk_members(term, &mut result, &id, &ifaces, "remove").await?;
                }
                VlanClause::Delete { id } => {
                    term.set_prompt(REGEX_CONFIG)?;
                    term.execute("configure terminal").await?;
                    collect_errors(&mut result, term.execute(&format!("no vlan {id}")).await?);
                    term.set_prompt(REGEX_ROOT)?;
                    collect_errors(&mut result, term.execute("exit").await?);
                }
            }
        }

        term.set_prompt(REGEX_ROOT)?;
        collect_write_memory_errors(&mut result, term.execute("write memory").await?);
        mark_success(&mut result);
        boss.send_tree("result", &result).await
    }
}

#[async_trait]
impl Host for CiscoIos {
    async fn execute(&mut self, boss: &mut Boss, cmd: &str, args: &str) -> Result<()> {
        match cmd {
            "list-ifaces" => self.list_ifaces(boss).await,
            "get-vlan-info" => self.get_vlan_info(boss, args).await,
            "mod-vlans" => self.mod_vlans(boss, args).await,
            _ => bail!("Not implemented: {cmd}"),
        }
    }
}

async fn trunk_members(
    term: &mut Terminal,
    result: &mut PropTree,
    id: &str,
    ifaces: &[String],
    op: &str,
) -> Result<()> {
    term.set_prompt(REGEX_CONFIG)?;
    term.execute("configure terminal").await?;
    term.set_prompt(REGEX_CONFIG_IF)?;
    for iftid in ifaces {
        collect_errors(result, term.execute(&format!("interface {iftid}")).await?);
        collect_errors(
            result,
            term.execute(&format!("switchport trunk allowed vlan {op} {id}"))
                .await?,
        );
    }
    term.set_prompt(REGEX_CONFIG)?;
    collect_errors(result, term.execute("exit").await?);
    term.set_prompt(REGEX_ROOT)?;
    collect_errors(result, term.execute("exit").await?);
    Ok(())
}

/// Configuration commands are expected to be silent; any output line is an
/// error to report.
fn collect_errors(result: &mut PropTree, lines: Vec<String>) {
    for line in lines {
        result.at("errors").push(PropTree::leaf(line));
    }
}

/// `write memory` chatters while saving; only unexpected lines count as
/// errors.
fn collect_write_memory_errors(result: &mut PropTree, lines: Vec<String>) {
    for line in lines {
        if !line.starts_with("Building configuration...") && !line.starts_with("[OK]") {
            result.at("errors").push(PropTree::leaf(line));
        }
    }
}

fn tail(val: &str, skip: usize) -> &str {
    val.get(skip..).unwrap_or("")
}

/// Builds the `interfaces` tree from the five SNMP walks. Rows arrive keyed
/// by ifIndex; the name walk fixes which indexes are interesting.
#[derive(Default)]
struct IfaceScan {
    tree: PropTree,
    by_index: HashMap<String, String>,
}

impl IfaceScan {
    fn on_name(&mut self, num: &str, val: &str) {
        let ifname = snmp::un_string(val);
        if IFACE_NAME.is_match(&ifname) {
            self.by_index.insert(num.to_string(), ifname.clone());
        }
        if ifname.starts_with("Po") {
            self.tree.at(&ifname).at("members").set_data("0");
        }
    }

    fn on_alias(&mut self, num: &str, val: &str) {
        if let Some(name) = self.by_index.get(num) {
            let descr = snmp::un_string(val);
            self.tree.at(name).at("description").set_data(descr);
        }
    }

    fn on_speed(&mut self, num: &str, val: &str) {
        if let Some(name) = self.by_index.get(num) {
            let entry = self.tree.at(name);
            entry.at("speed").set_data(tail(val, 9));
            entry.at("members");
            entry.at("combiner");
        }
    }

    fn on_oper(&mut self, num: &str, val: &str) {
        if let Some(name) = self.by_index.get(num) {
            if snmp::un_string(val) != "up" && val.as_bytes().get(9) != Some(&b'1') {
                self.tree.at(name).at("speed").set_data("0");
            }
        }
    }

    /// pagpGroupIfIndex: a member row points at its channel-group ifIndex.
    fn on_lag_group(&mut self, num: &str, val: &str) {
        let group = tail(val, 9);
        if group == num || group == "0" {
            return;
        }
        if let Some(name) = self.by_index.get(group) {
            let members: i64 = self.tree.at(name).child_data("members").parse().unwrap_or(0);
            self.tree
                .at(name)
                .at("members")
                .set_data((members + 1).to_string());
        }
    }

    /// A LAG reports the aggregate rate; divide back down to per-member.
    fn finish(mut self) -> PropTree {
        let names: Vec<String> = self.tree.iter().map(|(k, _)| k.to_string()).collect();
        for name in names {
            let entry = self.tree.at(&name);
            let members: i64 = entry.child_data("members").parse().unwrap_or(0);
            if members > 0 {
                let speed: i64 = entry.child_data("speed").parse().unwrap_or(0);
                if speed > 0 {
                    entry.at("speed").set_data((speed / members).to_string());
                }
            }
        }
        self.tree
    }
}

#[derive(Default)]
struct VlanInfoScan {
    info: PropTree,
}

impl VlanInfoScan {
    fn on_line(&mut self, line: &str) {
        if let Some(caps) = VLAN_NAME_LINE.captures(line) {
            let name = caps[1].trim_end_matches(' ').to_string();
            self.info.at("name").set_data(name);
        }
        for member in VLAN_MEMBER.find_iter(line) {
            self.info
                .at("interfaces")
                .push(PropTree::leaf(member.as_str()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iface_scan_collects_names_descriptions_and_speeds() {
        let mut scan = IfaceScan::default();
        scan.on_name("10101", "STRING: \"Gi0/1\"");
        scan.on_name("10102", "STRING: \"Gi0/2\"");
        scan.on_name("10201", "STRING: \"Po1\"");
        scan.on_name("1", "STRING: \"Vl1\"");
        scan.on_alias("10101", "STRING: \"uplink to core\"");
        scan.on_alias("1", "STRING: \"mgmt\"");
        scan.on_speed("10101", "Gauge32: 1000");
        scan.on_speed("10102", "Gauge32: 1000");
        scan.on_speed("10201", "Gauge32: 2000");
        scan.on_oper("10101", "INTEGER: 1");
        scan.on_oper("10102", "INTEGER: 1");
        scan.on_oper("10201", "INTEGER: 1");
        scan.on_lag_group("10101", "INTEGER: 10201");
        scan.on_lag_group("10102", "INTEGER: 10201");
        scan.on_lag_group("10201", "INTEGER: 0");
        let tree = scan.finish();

        let gi1 = tree.get("Gi0/1").expect("Gi0/1");
        assert_eq!(gi1.child_data("description"), "uplink to core");
        assert_eq!(gi1.child_data("speed"), "1000");
        assert_eq!(gi1.child_data("members"), "");
        assert_eq!(gi1.child_data("combiner"), "");

        let po1 = tree.get("Po1").expect("Po1");
        assert_eq!(po1.child_data("members"), "2");
        assert_eq!(po1.child_data("speed"), "1000");

        assert!(tree.get("Vl1").is_none());
    }

    #[test]
    fn iface_scan_marks_down_ports_speed_zero() {
        let mut scan = IfaceScan::default();
        scan.on_name("10101", "STRING: \"Gi0/1\"");
        scan.on_speed("10101", "Gauge32: 1000");
        scan.on_oper("10101", "INTEGER: 2");
        let tree = scan.finish();
        assert_eq!(tree.get("Gi0/1").expect("Gi0/1").child_data("speed"), "0");
    }

    #[test]
    fn vlan_info_scan_reads_name_and_members() {
        let mut scan = VlanInfoScan::default();
        scan.on_line("10   V10-lab                        active    Gi0/1, Gi0/2");
        scan.on_line("                                              Po1");
        assert_eq!(scan.info.child_data("name"), "V10-lab");
        let members: Vec<&str> = scan
            .info
            .get("interfaces")
            .expect("interfaces")
            .iter()
            .map(|(_, c)| c.data())
            .collect();
        assert_eq!(members, vec!["Gi0/1", "Gi0/2", "Po1"]);
    }

    #[test]
    fn vlan_info_scan_ignores_inactive_rows() {
        let mut scan = VlanInfoScan::default();
        scan.on_line("20   V20-spare                      act/lshut");
        assert_eq!(scan.info.child_data("name"), "");
    }

    #[test]
    fn any_config_output_line_blocks_the_success_flag() {
        let mut result = PropTree::new();
        collect_errors(&mut result, Vec::new());
        collect_errors(
            &mut result,
            vec!["% Invalid input detected at '^' marker.".to_string()],
        );
        mark_success(&mut result);
        assert!(!result.child_exists("success"));
        let errors = result.get("errors").expect("errors");
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors.at_index(0).expect("first error").data(),
            "% Invalid input detected at '^' marker."
        );
    }

    #[test]
    fn a_clean_run_reports_success() {
        let mut result = PropTree::new();
        collect_errors(&mut result, Vec::new());
        collect_write_memory_errors(
            &mut result,
            vec!["Building configuration...".to_string(), "[OK]".to_string()],
        );
        mark_success(&mut result);
        assert_eq!(result.child_data("success"), "1");
        assert!(!result.child_exists("errors"));
    }

    #[test]
    fn write_memory_noise_is_filtered_but_failures_are_not() {
        let mut result = PropTree::new();
        collect_write_memory_errors(
            &mut result,
            vec![
                "Building configuration...".to_string(),
                "Error opening nvram:/startup-config (No such device)".to_string(),
            ],
        );
        mark_success(&mut result);
        assert!(!result.child_exists("success"));
        assert_eq!(result.get("errors").expect("errors").len(), 1);
    }
}
