use crate::clause::{parse_clauses, VlanClause};
use crate::xml::{self, Element};
use crate::{mark_success, require_vlan_id, Host};
use anyhow::{bail, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use swagent_boss::Boss;
use swagent_model::PropTree;
use swagent_terminal::{snmp, FullMatch, Protocol, Terminal};
use tracing::{info, warn};

const HELLO: &str = "<hello> \
  <capabilities> \
    <capability>urn:ietf:params:xml:ns:netconf:base:1.0</capability> \
    <capability>urn:ietf:params:xml:ns:netconf:capability:candidate:1.0</capability> \
    <capability>urn:ietf:params:xml:ns:netconf:capability:confirmed-commit:1.0</capability> \
    <capability>urn:ietf:params:xml:ns:netconf:capability:validate:1.0</capability> \
    <capability>urn:ietf:params:xml:ns:netconf:capability:url:1.0?protocol=http,ftp,file</capability> \
    <capability>http://xml.juniper.net/netconf/junos/1.0</capability> \
    <capability>http://xml.juniper.net/dmi/system/1.0</capability> \
  </capabilities> \
</hello>";

const RPC_GET_INTERFACES: &str =
    "<rpc><get-interface-information><extensive/></get-interface-information></rpc>";
const RPC_GET_VLANS: &str = "<rpc><get-vlan-information/></rpc>";
const RPC_LOCK: &str = "<rpc><lock><target><candidate/></target></lock></rpc>";
const RPC_UNLOCK: &str = "<rpc><unlock><target><candidate/></target></unlock></rpc>";
const RPC_COMMIT: &str = "<rpc><commit/></rpc>";

const OID_IF_NAME: &str = ".1.3.6.1.2.1.31.1.1.1.1";
const OID_IF_ALIAS: &str = ".1.3.6.1.2.1.31.1.1.1.18";
const OID_IF_HIGH_SPEED: &str = ".1.3.6.1.2.1.31.1.1.1.15";
const OID_IF_OPER_STATUS: &str = ".1.3.6.1.2.1.2.2.1.8";

static IFACE_NAME: Lazy<FullMatch> = Lazy::new(|| {
    FullMatch::new(r"((ge|xe)-[0-9]+/[0-9]+(/[0-9]+)?)|(ae[0-9]+).*").expect("iface name")
});
static IFACE_CAPTURE: Lazy<FullMatch> = Lazy::new(|| {
    FullMatch::new(r"(((ge|xe)-[0-9]+/[0-9]+(/[0-9]+)?)|(ae[0-9]+)).*").expect("iface capture")
});
static PHYS_IFACE: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r"((ge|xe)-[0-9]+/[0-9]+(/[0-9]+)?).*").expect("phys iface"));
static OLD_IFACE: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r"(ge|xe)-[0-9]+/[0-9]+(/[0-9]+)?").expect("old iface"));
static OPER_UP: Lazy<FullMatch> = Lazy::new(|| FullMatch::new(r"up.*").expect("oper up"));
static SPEED_LOWER: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r"([0-9]+)m.*").expect("speed lower"));
static SPEED_UNIT: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r"([0-9]+)([MGT])bps.*").expect("speed unit"));
static SPEED_PARTNER: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r"([0-9]+) Mbps.*").expect("speed partner"));
static VLAN_PREFIXED: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r"V[0-9]{1,4}-.*").expect("vlan prefixed"));
static VLAN_NAME_STRIP: Lazy<FullMatch> =
    Lazy::new(|| FullMatch::new(r"V[0-9]{1,4}-(.*)").expect("vlan name strip"));

/// Juniper switch driven over the NETCONF subsystem. The VLAN database is
/// fetched once per session and invalidated on commit; VLAN modifications
/// build a candidate edit-config document under a lock and commit when the
/// command (or the session) finishes.
pub struct JunosSwitch {
    phost: PropTree,
    term: Option<Terminal>,
    vlan_db: Option<BTreeMap<String, VlanRecord>>,
    candidate: Option<CandidateConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VlanRecord {
    name: String,
    members: Vec<String>,
}

impl JunosSwitch {
    pub fn new(phost: PropTree) -> Self {
        JunosSwitch {
            phost,
            term: None,
            vlan_db: None,
            candidate: None,
        }
    }

    async fn terminal(&mut self) -> Result<&mut Terminal> {
        let term = match self.term.take() {
            Some(term) => term,
            None => {
                if !self.phost.child_exists("proto-netconfssh") {
                    bail!("Must use proto-netconfssh for a JunOS switch");
                }
                let proto = self.phost.get("proto-netconfssh").cloned().unwrap_or_default();
                let mut term = Terminal::connect(
                    Protocol::NetconfSsh,
                    self.phost.child_data("hostname"),
                    &proto,
                    None,
                    None,
                )
                .await?;
                // The server hello comes back on the same exchange and is
                // not inspected.
                term.rpc(HELLO).await?;
                term
            }
        };
        Ok(self.term.insert(term))
    }

    async fn load_db(&mut self) -> Result<()> {
        if self.vlan_db.is_some() {
            return Ok(());
        }
        let reply = self.terminal().await?.rpc(RPC_GET_VLANS).await?;
        let db = parse_vlan_db(&reply)?;
        info!(target: "hosts::junos", vlans = db.len(), "vlan database loaded");
        self.vlan_db = Some(db);
        Ok(())
    }

    async fn lock_config(&mut self) -> Result<()> {
        if self.candidate.is_some() {
            return Ok(());
        }
        let reply = self.terminal().await?.rpc(RPC_LOCK).await?;
        check_reply(&reply)?;
        self.candidate = Some(CandidateConfig::default());
        Ok(())
    }

    /// Flush the candidate document: load, commit, unlock. Load/commit
    /// failures are accumulated into `result` when one is supplied (the
    /// explicit `mod-vlans` path) and only logged on session close; the
    /// unlock always runs and its failure is fatal.
    async fn commit_config(&mut self, result: Option<&mut PropTree>) -> Result<()> {
        let Some(candidate) = self.candidate.take() else {
            return Ok(());
        };
        self.vlan_db = None;
        let document = candidate.render();
        let term = self.terminal().await?;
        if let Err(err) = push_candidate(term, &document).await {
            match result {
                Some(result) => {
                    result.at("errors").push(PropTree::leaf(format!("{err}")));
                }
                None => warn!(target: "hosts::junos", %err, "commit on session close failed"),
            }
        }
        check_reply(&term.rpc(RPC_UNLOCK).await?)?;
        Ok(())
    }

    async fn list_ifaces(&mut self, boss: &mut Boss) -> Result<()> {
        let reply = self.terminal().await?.rpc(RPC_GET_INTERFACES).await?;
        let ifaces = parse_interfaces(&reply)?;
        info!(target: "hosts::junos", interfaces = ifaces.len(), "list-ifaces done");
        boss.send_tree("interfaces", &ifaces).await
    }

    async fn list_ifaces_old(&mut self, boss: &mut Boss) -> Result<()> {
        let community = self.phost.child_data("proto-snmp2").to_string();
        if community.is_empty() {
            bail!("Must supply an SNMPv2 community string for JunOS list-ifaces-old");
        }
        let ip = self.phost.child_data("hostname").to_string();
        if ip.is_empty() {
            bail!("Must supply a hostname or IP address for JunOS list-ifaces-old");
        }
        let mut scan = OldIfaceScan::default();
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
        boss.send_tree("interfaces", &scan.tree).await
    }

    async fn get_vlan_info(&mut self, boss: &mut Boss, args: &str) -> Result<()> {
        require_vlan_id(args)?;
        self.load_db().await?;
        let mut vlan_data = PropTree::new();
        if let Some(record) = self.vlan_db.as_ref().and_then(|db| db.get(args)) {
            let name = match VLAN_NAME_STRIP.captures(&record.name) {
                Some(caps) => caps[1].to_string(),
                None => record.name.clone(),
            };
            vlan_data.at("name").set_data(name);
            for member in &record.members {
                vlan_data
                    .at("interfaces")
                    .push(PropTree::leaf(member.clone()));
            }
        }
        boss.send_tree("vlan", &vlan_data).await
    }

    async fn mod_vlans(&mut self, boss: &mut Boss, args: &str) -> Result<()> {
        let mut result = PropTree::new();
        self.load_db().await?;
        self.lock_config().await?;
        for clause in parse_clauses(args) {
            match clause {
                VlanClause::Create { id, name } => {
                    let name = if VLAN_PREFIXED.is_match(&name) {
                        name
                    } else {
                        format!("V{id}-{name}")
                    };
                    if let Some(candidate) = self.candidate.as_mut() {
                        candidate.vlans.push(VlanEdit {
                            name: name.clone(),
                            vlan_id: Some(id.clone()),
                            delete: false,
                            members: Vec::new(),
                        });
                    }
                    if let Some(db) = self.vlan_db.as_mut() {
                        db.entry(id).or_insert(VlanRecord {
                            name,
                            members: Vec::new(),
                        });
                    }
                }
                // Rename parses but applies no configuration change.
                VlanClause::Rename { .. } => {}
                VlanClause::AddMembers { id, ifaces } => {
                    self.member_edit(&mut result, &id, &ifaces, false);
                }
                VlanClause::RemoveMembers { id, ifaces } => {
                    self.member_edit(&mut result, &id, &ifaces, true);
                }
                VlanClause::Delete { id } => {
                    let record = self.vlan_db.as_mut().and_then(|db| db.remove(&id));
                    match record {
                        Some(record) => {
                            if let Some(candidate) = self.candidate.as_mut() {
                                candidate.vlans.push(VlanEdit {
                                    name: record.name,
                                    vlan_id: None,
                                    delete: true,
                                    members: Vec::new(),
                                });
                            }
                        }
                        None => {
                            result
                                .at("errors")
                                .push(PropTree::leaf(format!("VLAN {id} not present")));
                        }
                    }
                }
            }
        }
        self.commit_config(Some(&mut result)).await?;
        mark_success(&mut result);
        boss.send_tree("result", &result).await
    }

    fn member_edit(&mut self, result: &mut PropTree, id: &str, ifaces: &[String], delete: bool) {
        let name = self
            .vlan_db
            .as_ref()
            .and_then(|db| db.get(id))
            .map(|record| record.name.clone());
        match name {
            Some(name) => {
                if let Some(candidate) = self.candidate.as_mut() {
                    let entry = candidate.vlan_entry(&name);
                    for iftid in ifaces {
                        entry.members.push(MemberEdit {
                            name: format!("{iftid}.0"),
                            delete,
                        });
                    }
                }
            }
            None => {
                result
                    .at("errors")
                    .push(PropTree::leaf(format!("VLAN {id} not present")));
            }
        }
    }

    async fn get_half_duplex_ifaces(&mut self, boss: &mut Boss) -> Result<()> {
        let reply = self.terminal().await?.rpc(RPC_GET_INTERFACES).await?;
        let ifaces = parse_half_duplex(&reply)?;
        boss.send_tree("interfaces", &ifaces).await
    }
}

#[async_trait]
impl Host for JunosSwitch {
    async fn execute(&mut self, boss: &mut Boss, cmd: &str, args: &str) -> Result<()> {
        match cmd {
            "list-ifaces" => self.list_ifaces(boss).await,
            "list-ifaces-old" => self.list_ifaces_old(boss).await,
            "get-vlan-info" => self.get_vlan_info(boss, args).await,
            "mod-vlans" => self.mod_vlans(boss, args).await,
            "get-half-duplex-ifaces" => self.get_half_duplex_ifaces(boss).await,
            _ => bail!("Not implemented: {cmd}"),
        }
    }

    async fn close(&mut self, _boss: &mut Boss) -> Result<()> {
        self.commit_config(None).await
    }
}

async fn push_candidate(term: &mut Terminal, document: &str) -> Result<()> {
    check_reply(&term.rpc(document).await?)?;
    check_reply(&term.rpc(RPC_COMMIT).await?)?;
    Ok(())
}

/// A configuration RPC must answer `<ok/>`; anything else carries an
/// `rpc-error` (possibly nested under `commit-results`).
fn check_reply(reply: &str) -> Result<()> {
    let root = xml::parse(reply)?;
    if root.child("ok").is_some() {
        return Ok(());
    }
    let scope = root.child("commit-results").unwrap_or(&root);
    let message = scope
        .child("rpc-error")
        .and_then(|e| e.text_of("error-message"))
        .filter(|m| !m.is_empty());
    bail!("{}", message.unwrap_or("Command failed for an unknown reason"))
}

fn rpc_error_message(root: &Element, fallback: &str) -> String {
    match root
        .child("rpc-error")
        .and_then(|e| e.text_of("error-message"))
        .filter(|m| !m.is_empty())
    {
        Some(message) => format!("RPC error: {message}"),
        None => format!("RPC error: {fallback}"),
    }
}

fn parse_interfaces(reply: &str) -> Result<PropTree> {
    let root = xml::parse(reply)?;
    let phys: Vec<&Element> = root
        .child("interface-information")
        .map(|info| info.children_named("physical-interface").collect())
        .unwrap_or_default();
    if phys.is_empty() {
        bail!(rpc_error_message(&root, "No interface information returned"));
    }

    let mut tree = PropTree::new();
    for iface in phys {
        let Some(name) = iface.text_of("name") else {
            continue;
        };
        if !IFACE_NAME.is_match(name) {
            continue;
        }
        let is_lag = name.starts_with("ae");
        let entry = tree.at(name);
        match iface.text_of("description") {
            Some(descr) => entry.at("description").set_data(descr),
            None => {
                entry.at("description");
            }
        }

        let mut speed: i64 = -1;
        let mut unit = 'M';
        let oper_up = iface
            .text_of("oper-status")
            .map(|status| OPER_UP.is_match(status))
            .unwrap_or(false);
        if oper_up {
            if let Some(text) = iface.text_of("speed") {
                if let Some(caps) = SPEED_LOWER.captures(text) {
                    speed = caps[1].parse().unwrap_or(-1);
                } else if let Some(caps) = SPEED_UNIT.captures(text) {
                    speed = caps[1].parse().unwrap_or(-1);
                    unit = caps[2].chars().next().unwrap_or('M');
                }
            }
            if speed < 0 {
                // A port that negotiated below its nominal rate reports no
                // speed of its own; fall back to the link partner, then to
                // the 10M floor.
                speed = iface
                    .child("ethernet-autonegotiation")
                    .and_then(|auto| auto.text_of("link-partner-speed"))
                    .and_then(|text| SPEED_PARTNER.captures(text))
                    .and_then(|caps| caps[1].parse().ok())
                    .unwrap_or(10);
            }
        }
        let mut speed = if speed < 0 {
            0
        } else {
            match unit {
                'G' => speed * 1000,
                'T' => speed * 1_000_000,
                _ => speed,
            }
        };

        if is_lag {
            if speed > 0 {
                // The aggregate rate encodes the member count in its leading
                // decimal digit: 30Gbps means three 10G members.
                let mut base = 1i64;
                while base * 10 <= speed {
                    base *= 10;
                }
                let members = speed / base;
                entry.at("members").set_data(members.to_string());
                speed /= members;
            } else {
                entry.at("members").set_data("0");
            }
        } else {
            entry.at("members");
        }
        entry.at("speed").set_data(speed.to_string());
        entry.at("combiner");
    }
    Ok(tree)
}

fn parse_vlan_db(reply: &str) -> Result<BTreeMap<String, VlanRecord>> {
    let root = xml::parse(reply)?;
    let vlans: Vec<&Element> = root
        .child("vlan-information")
        .map(|info| info.children_named("vlan").collect())
        .unwrap_or_default();
    if vlans.is_empty() {
        bail!(rpc_error_message(&root, "No vlan information returned"));
    }

    let mut db = BTreeMap::new();
    for vlan in vlans {
        let tag = match vlan.text_of("vlan-tag") {
            Some(tag) if !tag.is_empty() => tag.to_string(),
            _ => continue,
        };
        let name = vlan.text_of("vlan-name").unwrap_or("").to_string();
        let record = db.entry(tag).or_insert(VlanRecord {
            name,
            members: Vec::new(),
        });
        let members = vlan
            .child("vlan-detail")
            .and_then(|detail| detail.child("vlan-member-list"))
            .map(|list| list.children_named("vlan-member"))
            .into_iter()
            .flatten();
        for member in members {
            if let Some(iface) = member.text_of("vlan-member-interface") {
                if let Some(caps) = IFACE_CAPTURE.captures(iface) {
                    record.members.push(caps[1].to_string());
                }
            }
        }
    }
    Ok(db)
}

fn parse_half_duplex(reply: &str) -> Result<PropTree> {
    let root = xml::parse(reply)?;
    let phys: Vec<&Element> = root
        .child("interface-information")
        .map(|info| info.children_named("physical-interface").collect())
        .unwrap_or_default();
    if phys.is_empty() {
        bail!(rpc_error_message(&root, "No interface information returned"));
    }

    let mut tree = PropTree::new();
    for iface in phys {
        let Some(name) = iface.text_of("name") else {
            continue;
        };
        if !PHYS_IFACE.is_match(name) {
            continue;
        }
        if iface.text_of("oper-status") != Some("up") {
            continue;
        }
        if iface.text_of("duplex") != Some("Auto") {
            continue;
        }
        let partner_duplex = iface
            .child("ethernet-autonegotiation")
            .and_then(|auto| auto.text_of("link-partner-duplexity"));
        match partner_duplex {
            Some("full-duplex") | None => continue,
            Some(_) => {
                tree.push(PropTree::leaf(name));
            }
        }
    }
    Ok(tree)
}

#[derive(Debug, Default)]
struct CandidateConfig {
    vlans: Vec<VlanEdit>,
}

#[derive(Debug)]
struct VlanEdit {
    name: String,
    vlan_id: Option<String>,
    delete: bool,
    members: Vec<MemberEdit>,
}

#[derive(Debug)]
struct MemberEdit {
    name: String,
    delete: bool,
}

impl CandidateConfig {
    fn vlan_entry(&mut self, name: &str) -> &mut VlanEdit {
        if let Some(pos) = self.vlans.iter().position(|vlan| vlan.name == name) {
            return &mut self.vlans[pos];
        }
        self.vlans.push(VlanEdit {
            name: name.to_string(),
            vlan_id: None,
            delete: false,
            members: Vec::new(),
        });
        let last = self.vlans.len() - 1;
        &mut self.vlans[last]
    }

    fn render(&self) -> String {
        let mut body = String::new();
        for vlan in &self.vlans {
            if vlan.delete {
                body.push_str("<vlan operation=\"delete\">");
            } else {
                body.push_str("<vlan>");
            }
            body.push_str("<name>");
            body.push_str(&xml::escape_text(&vlan.name));
            body.push_str("</name>");
            if let Some(id) = &vlan.vlan_id {
                body.push_str("<vlan-id>");
                body.push_str(id);
                body.push_str("</vlan-id>");
            }
            for member in &vlan.members {
                if member.delete {
                    body.push_str("<interface operation=\"delete\">");
                } else {
                    body.push_str("<interface>");
                }
                body.push_str("<name>");
                body.push_str(&xml::escape_text(&member.name));
                body.push_str("</name></interface>");
            }
            body.push_str("</vlan>");
        }
        format!(
            "<rpc><edit-config><target><candidate/></target><config><configuration>\
             <vlans>{body}</vlans></configuration></config></edit-config></rpc>"
        )
    }
}

fn tail(val: &str, skip: usize) -> &str {
    val.get(skip..).unwrap_or("")
}

/// SNMP fallback interface listing; same walk set as the IOS handler minus
/// the channel-group pass.
#[derive(Default)]
struct OldIfaceScan {
    tree: PropTree,
    by_index: HashMap<String, String>,
}

impl OldIfaceScan {
    fn on_name(&mut self, num: &str, val: &str) {
        let name = tail(val, 8);
        if OLD_IFACE.is_match(name) {
            self.by_index.insert(num.to_string(), name.to_string());
        }
    }

    fn on_alias(&mut self, num: &str, val: &str) {
        if let Some(name) = self.by_index.get(num) {
            self.tree.at(name).at("description").set_data(tail(val, 8));
        }
    }

    fn on_speed(&mut self, num: &str, val: &str) {
        if let Some(name) = self.by_index.get(num) {
            self.tree.at(name).at("speed").set_data(tail(val, 9));
        }
    }

    fn on_oper(&mut self, num: &str, val: &str) {
        if let Some(name) = self.by_index.get(num) {
            if val.get(9..11) != Some("up") {
                self.tree.at(name).at("speed").set_data("0");
            }
        }
    }
}
