use once_cell::sync::Lazy;
use regex::Regex;

/// One parsed `mod-vlans` clause. The argument string is consumed left to
/// right; the first stretch that matches no clause ends the scan, and any
/// trailing input is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlanClause {
    Create { id: String, name: String },
    Rename { id: String, name: String },
    AddMembers { id: String, ifaces: Vec<String> },
    RemoveMembers { id: String, ifaces: Vec<String> },
    Delete { id: String },
}

static CREATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^create ([0-9]{1,4}) "([a-zA-Z0-9_-]+)" *"#).expect("create"));
static RENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^rename ([0-9]{1,4}) "([a-zA-Z0-9_-]+)" *"#).expect("rename"));
static ADD_MEMBERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^add-members ([0-9]{1,4}) ").expect("add-members"));
static REMOVE_MEMBERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^remove-members ([0-9]{1,4}) ").expect("remove-members"));
static DELETE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^delete ([0-9]{1,4}) *").expect("delete"));
static IFACE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^iface:"([^"]+)" *"#).expect("iface"));

pub fn parse_clauses(args: &str) -> Vec<VlanClause> {
    let mut rest = args;
    let mut clauses = Vec::new();
    loop {
        if let Some(caps) = consume(&mut rest, &CREATE) {
            clauses.push(VlanClause::Create {
                id: caps[1].to_string(),
                name: caps[2].to_string(),
            });
        } else if let Some(caps) = consume(&mut rest, &RENAME) {
            clauses.push(VlanClause::Rename {
                id: caps[1].to_string(),
                name: caps[2].to_string(),
            });
        } else if let Some(caps) = consume(&mut rest, &ADD_MEMBERS) {
            clauses.push(VlanClause::AddMembers {
                id: caps[1].to_string(),
                ifaces: consume_ifaces(&mut rest),
            });
        } else if let Some(caps) = consume(&mut rest, &REMOVE_MEMBERS) {
            clauses.push(VlanClause::RemoveMembers {
                id: caps[1].to_string(),
                ifaces: consume_ifaces(&mut rest),
            });
        } else if let Some(caps) = consume(&mut rest, &DELETE) {
            clauses.push(VlanClause::Delete {
                id: caps[1].to_string(),
            });
        } else {
            break;
        }
    }
    clauses
}

fn consume<'a>(rest: &mut &'a str, re: &Regex) -> Option<regex::Captures<'a>> {
    let caps = re.captures(*rest)?;
    let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
    *rest = &(*rest)[end..];
    Some(caps)
}

fn consume_ifaces(rest: &mut &str) -> Vec<String> {
    let mut ifaces = Vec::new();
    while let Some(caps) = consume(rest, &IFACE) {
        ifaces.push(caps[1].to_string());
    }
    ifaces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_clause_kind_in_order() {
        let args = "create 10 \"V10-lab\" rename 11 \"eleven\" \
                    add-members 10 iface:\"g1\" iface:\"g2\" \
                    remove-members 11 iface:\"g3\" delete 12 ";
        let clauses = parse_clauses(args);
        assert_eq!(
            clauses,
            vec![
                VlanClause::Create {
                    id: "10".into(),
                    name: "V10-lab".into()
                },
                VlanClause::Rename {
                    id: "11".into(),
                    name: "eleven".into()
                },
                VlanClause::AddMembers {
                    id: "10".into(),
                    ifaces: vec!["g1".into(), "g2".into()]
                },
                VlanClause::RemoveMembers {
                    id: "11".into(),
                    ifaces: vec!["g3".into()]
                },
                VlanClause::Delete { id: "12".into() },
            ]
        );
    }

    #[test]
    fn unmatched_trailing_input_ends_the_scan() {
        let clauses = parse_clauses("delete 5 explode 6 delete 7 ");
        assert_eq!(clauses, vec![VlanClause::Delete { id: "5".into() }]);
    }

    #[test]
    fn vlan_ids_are_one_to_four_digits() {
        assert!(parse_clauses("delete 12345 ").is_empty());
        assert!(parse_clauses("create abc \"name\" ").is_empty());
    }

    #[test]
    fn member_lists_allow_quoted_interface_ids() {
        let clauses = parse_clauses("add-members 100 iface:\"1/g1\" iface:\"2/x1\" ");
        assert_eq!(
            clauses,
            vec![VlanClause::AddMembers {
                id: "100".into(),
                ifaces: vec!["1/g1".into(), "2/x1".into()]
            }]
        );
    }

    #[test]
    fn empty_args_parse_to_nothing() {
        assert!(parse_clauses("").is_empty());
    }
}
