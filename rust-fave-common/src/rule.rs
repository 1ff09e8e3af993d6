//! Rule records carried by device models and commands.

use crate::field::encode_value;
use crate::mapping::FieldMapping;
use crate::vector::Vector;
use crate::Result;
use serde::{de, Deserialize, Deserializer, Serialize};

/// `name = value`, optionally negated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleField {
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub value: String,
    #[serde(default)]
    pub negated: bool,
}

impl RuleField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            negated: false,
        }
    }

    pub fn negated(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            negated: true,
            ..Self::new(name, value)
        }
    }

    /// The value's bits, without regard to negation.
    pub fn to_vector(&self) -> Result<Vector> {
        encode_value(&self.name, &self.value)
    }
}

/// Field values arrive as JSON strings or numbers.
pub(crate) fn value_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    let shown = value.to_string();
    value_to_string(value).ok_or_else(|| de::Error::custom(format!("unsupported field value: {}", shown)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    #[serde(default)]
    pub fields: Vec<RuleField>,
}

impl Match {
    pub fn new(fields: Vec<RuleField>) -> Self {
        Self { fields }
    }
}

/// What a rule does with matching packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Action {
    Forward { ports: Vec<String> },
    Rewrite { rw: Vec<RuleField> },
    Miss,
}

/// One entry of a rule table.
///
/// Equality only looks at what the verification engine sees: the index, the
/// match, the actions and the input ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub node: String,
    /// Name of the table holding this rule.
    #[serde(default)]
    pub tid: String,
    pub idx: u32,
    #[serde(default)]
    pub in_ports: Vec<String>,
    #[serde(default)]
    pub r#match: Match,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Layout the producer used for this rule, if it sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<FieldMapping>,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx
            && self.r#match == other.r#match
            && self.actions == other.actions
            && self.in_ports == other.in_ports
    }
}

impl Eq for Rule {}

impl Rule {
    pub fn new(node: impl Into<String>, tid: impl Into<String>, idx: u32) -> Self {
        Self {
            node: node.into(),
            tid: tid.into(),
            idx,
            in_ports: Vec::new(),
            r#match: Match::default(),
            actions: Vec::new(),
            mapping: None,
        }
    }

    pub fn with_in_ports(mut self, ports: Vec<String>) -> Self {
        self.in_ports = ports;
        self
    }

    pub fn with_match(mut self, fields: Vec<RuleField>) -> Self {
        self.r#match = Match::new(fields);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Ports named by all forward actions, in order.
    pub fn forward_ports(&self) -> impl Iterator<Item = &str> + '_ {
        self.actions
            .iter()
            .flat_map(|a| match a {
                Action::Forward { ports } => ports.as_slice(),
                _ => &[],
            })
            .map(String::as_str)
    }

    /// Fields rewritten by all rewrite actions, in order.
    pub fn rewrites(&self) -> impl Iterator<Item = &RuleField> + '_ {
        self.actions.iter().flat_map(|a| match a {
            Action::Rewrite { rw } => rw.as_slice(),
            _ => &[],
        })
    }

    /// A rule without forward actions drops matching packets.
    pub fn is_drop(&self) -> bool {
        self.forward_ports().next().is_none()
    }

    /// Names of every field the rule matches on or rewrites.
    pub fn field_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.r#match
            .fields
            .iter()
            .chain(self.rewrites())
            .map(|f| f.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_json() {
        let raw = json!({
            "node": "fw",
            "tid": "fw.input_filter",
            "idx": 3,
            "in_ports": ["fw.input_filter_in"],
            "match": {"fields": [
                {"name": "packet.upper.dport", "value": 22},
                {"name": "packet.ipv6.source", "value": "2001:db8::/32", "negated": true}
            ]},
            "actions": [{"name": "forward", "ports": ["fw.input_filter_accept"]}]
        });

        let rule: Rule = serde_json::from_value(raw).unwrap();
        assert_eq!(rule.idx, 3);
        assert_eq!(rule.r#match.fields[0].value, "22");
        assert!(rule.r#match.fields[1].negated);
        assert_eq!(rule.forward_ports().collect::<Vec<_>>(), vec!["fw.input_filter_accept"]);
        assert!(!rule.is_drop());

        let back = serde_json::to_value(&rule).unwrap();
        assert_eq!(back["match"]["fields"][0]["value"], "22");
        assert_eq!(back["actions"][0]["name"], "forward");
    }

    #[test]
    fn test_equality_ignores_owner() {
        let a = Rule::new("fw", "fw.t1", 0).with_match(vec![RuleField::new("module", "limit")]);
        let mut b = a.clone();
        b.node = "other".into();
        b.tid = "other.t1".into();
        assert_eq!(a, b);

        let c = a.clone().with_action(Action::Forward {
            ports: vec!["fw.t1_accept".into()],
        });
        assert_ne!(a, c);
    }

    #[test]
    fn test_actions() {
        let rule = Rule::new("s", "s.1", 1)
            .with_action(Action::Rewrite {
                rw: vec![RuleField::new("out_port", "x".repeat(32))],
            })
            .with_action(Action::Miss);

        assert!(rule.is_drop());
        assert_eq!(rule.field_names().collect::<Vec<_>>(), vec!["out_port"]);

        let json = serde_json::to_value(&rule.actions).unwrap();
        assert_eq!(json[1], json!({"name": "miss"}));
    }
}
