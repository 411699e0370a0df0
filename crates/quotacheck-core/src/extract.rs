//! Turning provider payloads into resource counts.
//!
//! Query-protocol APIs (EC2, RDS, ...) answer with XML where each resource is
//! an `<item>` inside a named set (`<vpcSet>`). JSON-protocol APIs answer
//! with an array under a known key. Both are covered here; anything else can
//! implement [`UsageExtractor`].

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Errors from payload extraction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Element <{0}> not found in response")]
    MissingElement(String),

    #[error("Element <{0}> is not closed")]
    Unterminated(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("No array at JSON pointer '{0}'")]
    NotAnArray(String),
}

/// Pure function from a success payload to a resource count.
pub trait UsageExtractor: Send + Sync + fmt::Debug {
    fn count(&self, payload: &str) -> Result<u64, ExtractError>;
}

lazy_static! {
    static ref XML_TAG: Regex =
        Regex::new(r"<(/?)([A-Za-z_][\w:.\-]*)((?:\s[^>]*?)?)(/?)>").expect("valid tag regex");
    static ref XML_OPAQUE: Regex =
        Regex::new(r"(?s)<!--.*?-->|<!\[CDATA\[.*?\]\]>").expect("valid comment regex");
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Counts the direct `<item>` children of the first `<set>` element.
///
/// Nested items (e.g. a VPC's `<tagSet>`) are not counted, nor is markup
/// inside comments or CDATA sections. Only the payload given is counted: a
/// response carrying a `<nextToken>` is one page of several, so configure
/// the query so the whole set fits one page (e.g. `MaxResults`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlSetCounter {
    set: String,
}

impl XmlSetCounter {
    pub fn new(set: impl Into<String>) -> Self {
        Self { set: set.into() }
    }
}

impl UsageExtractor for XmlSetCounter {
    fn count(&self, payload: &str) -> Result<u64, ExtractError> {
        let payload = XML_OPAQUE.replace_all(payload, "");
        let mut depth = 0usize;
        let mut set_depth: Option<usize> = None;
        let mut count = 0u64;

        for cap in XML_TAG.captures_iter(&payload) {
            let closing = !cap[1].is_empty();
            let name = local_name(&cap[2]);
            let self_closing = !cap[4].is_empty();

            if closing {
                depth = depth.saturating_sub(1);
                if set_depth == Some(depth) {
                    return Ok(count);
                }
                continue;
            }

            match set_depth {
                None if name == self.set => {
                    if self_closing {
                        return Ok(0);
                    }
                    set_depth = Some(depth);
                }
                Some(d) if depth == d + 1 && name == "item" => count += 1,
                _ => {}
            }

            if !self_closing {
                depth += 1;
            }
        }

        match set_depth {
            Some(_) => Err(ExtractError::Unterminated(self.set.clone())),
            None => Err(ExtractError::MissingElement(self.set.clone())),
        }
    }
}

/// Counts the elements of the array found at a JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonArrayCounter {
    pointer: String,
}

impl JsonArrayCounter {
    /// Create a counter for `pointer` (RFC 6901, e.g. `/Vpcs`).
    pub fn new(pointer: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
        }
    }
}

impl UsageExtractor for JsonArrayCounter {
    fn count(&self, payload: &str) -> Result<u64, ExtractError> {
        let value: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| ExtractError::InvalidJson(e.to_string()))?;

        value
            .pointer(&self.pointer)
            .and_then(|v| v.as_array())
            .map(|items| items.len() as u64)
            .ok_or_else(|| ExtractError::NotAnArray(self.pointer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIBE_VPCS_1: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeVpcsResponse xmlns="http://ec2.amazonaws.com/doc/2015-10-01/">
    <requestId>7a62c49f-347e-4fc4-9331-6e8eEXAMPLE</requestId>
    <vpcSet>
        <item>
            <vpcId>vpc-1a2b3c4d</vpcId>
            <state>available</state>
            <cidrBlock>10.0.0.0/23</cidrBlock>
            <dhcpOptionsId>dopt-7a8b9c2d</dhcpOptionsId>
            <instanceTenancy>default</instanceTenancy>
            <isDefault>false</isDefault>
            <tagSet>
                <item>
                    <key>Name</key>
                    <value>main</value>
                </item>
            </tagSet>
        </item>
    </vpcSet>
</DescribeVpcsResponse>"#;

    #[test]
    fn test_counts_direct_items_only() {
        let counter = XmlSetCounter::new("vpcSet");
        assert_eq!(counter.count(DESCRIBE_VPCS_1), Ok(1));
    }

    #[test]
    fn test_counts_several_items() {
        let payload = "<R><vpcSet><item><vpcId>a</vpcId></item><item/><item><x/></item></vpcSet></R>";
        assert_eq!(XmlSetCounter::new("vpcSet").count(payload), Ok(3));
    }

    #[test]
    fn test_empty_set_is_zero() {
        let counter = XmlSetCounter::new("vpcSet");
        assert_eq!(counter.count("<R><vpcSet/></R>"), Ok(0));
        assert_eq!(counter.count("<R><vpcSet></vpcSet></R>"), Ok(0));
    }

    #[test]
    fn test_missing_set_is_error() {
        let counter = XmlSetCounter::new("vpcSet");
        assert_eq!(
            counter.count("<R><subnetSet/></R>"),
            Err(ExtractError::MissingElement("vpcSet".to_string()))
        );
        assert_eq!(
            counter.count("<R><vpcSet><item>"),
            Err(ExtractError::Unterminated("vpcSet".to_string()))
        );
    }

    #[test]
    fn test_ignores_comments_and_cdata() {
        let payload = "<R><vpcSet><!-- <item/> --><item><d><![CDATA[<item/>]]></d></item>\n<!--\n<item/>\n--></vpcSet></R>";
        assert_eq!(XmlSetCounter::new("vpcSet").count(payload), Ok(1));
    }

    #[test]
    fn test_namespaced_elements() {
        let payload = "<ec2:R><ec2:vpcSet><ec2:item/><ec2:item/></ec2:vpcSet></ec2:R>";
        assert_eq!(XmlSetCounter::new("vpcSet").count(payload), Ok(2));
    }

    #[test]
    fn test_json_array_counter() {
        let counter = JsonArrayCounter::new("/Vpcs");
        assert_eq!(counter.count(r#"{"Vpcs": [{"VpcId": "a"}, {"VpcId": "b"}]}"#), Ok(2));
        assert_eq!(counter.count(r#"{"Vpcs": []}"#), Ok(0));
        assert_eq!(
            counter.count(r#"{"Vpcs": {}}"#),
            Err(ExtractError::NotAnArray("/Vpcs".to_string()))
        );
        assert!(matches!(
            counter.count("not json"),
            Err(ExtractError::InvalidJson(_))
        ));
    }
}
