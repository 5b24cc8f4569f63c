//! Minimal XML tree used by the Bugzilla CGI and Mantis SOAP parsers
//!
//! Both trackers return small documents (one issue at a time), so building
//! an element tree from quick-xml events is simpler and safer than juggling
//! parser state across the two formats.

use crate::{BzJiraError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

/// One parsed XML element. Namespaces are stripped from names: SOAP
/// responses prefix everything and the payloads never have name collisions.
#[derive(Debug, Clone, Default)]
pub struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    /// Parse a document and return its root element.
    ///
    /// Text is not trimmed at the reader: entity references arrive as
    /// separate events, and reader-level trimming would also strip the
    /// spaces around them inside mixed content. The accessors trim instead.
    pub fn parse(xml: &str) -> Result<XmlElement> {
        let mut reader = Reader::from_str(xml);

        let mut stack: Vec<XmlElement> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    stack.push(element_from_start(e)?);
                }
                Ok(Event::Empty(ref e)) => {
                    let element = element_from_start(e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::Text(ref t)) => {
                    if let Some(current) = stack.last_mut() {
                        let text = t
                            .decode()
                            .map_err(|e| BzJiraError::Parse(format!("Invalid XML text: {}", e)))?;
                        current.text.push_str(&text);
                    }
                }
                // Entity and character references arrive as their own events,
                // split out of the surrounding text
                Ok(Event::GeneralRef(ref r)) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push(resolve_reference(r)?);
                    }
                }
                Ok(Event::CData(ref t)) => {
                    if let Some(current) = stack.last_mut() {
                        current
                            .text
                            .push_str(&String::from_utf8_lossy(t.as_ref()));
                    }
                }
                Ok(Event::End(_)) => {
                    let done = stack
                        .pop()
                        .ok_or_else(|| BzJiraError::Parse("Unbalanced XML".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => return Ok(done),
                    }
                }
                Ok(Event::Eof) => {
                    return Err(BzJiraError::Parse("Unexpected end of XML".to_string()));
                }
                Err(e) => {
                    return Err(BzJiraError::Parse(format!("Error parsing XML: {}", e)));
                }
                _ => {}
            }
        }
    }

    /// First child with this (namespace-stripped) name
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with this name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First descendant with this name, depth-first
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// Trimmed text of a child element, if present
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(|c| c.text.trim().to_string())
    }

    /// Trimmed text of a child element, or a parse error naming the field
    pub fn require_text(&self, name: &str) -> Result<String> {
        self.child_text(name).ok_or_else(|| {
            BzJiraError::Parse(format!("missing <{}> under <{}>", name, self.name))
        })
    }

    /// Attribute value by name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn element_from_start(e: &quick_xml::events::BytesStart) -> Result<XmlElement> {
    let raw_name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let name = strip_namespace(&raw_name).to_string();

    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| BzJiraError::Parse(format!("Invalid attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| BzJiraError::Parse(format!("Invalid attribute value: {}", e)))?
            .into_owned();
        attrs.push((strip_namespace(&key).to_string(), value));
    }

    Ok(XmlElement {
        name,
        attrs,
        children: Vec::new(),
        text: String::new(),
    })
}

fn strip_namespace(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Resolve a `&name;` / `&#N;` / `&#xN;` reference to its character. The
/// trackers only ever emit character references and the five predefined
/// entities; anything else is a parse error.
fn resolve_reference(r: &quick_xml::events::BytesRef) -> Result<char> {
    if let Some(ch) = r
        .resolve_char_ref()
        .map_err(|e| BzJiraError::Parse(format!("Invalid character reference: {}", e)))?
    {
        return Ok(ch);
    }

    let name = r
        .decode()
        .map_err(|e| BzJiraError::Parse(format!("Invalid entity reference: {}", e)))?;
    match name.as_ref() {
        "amp" => Ok('&'),
        "lt" => Ok('<'),
        "gt" => Ok('>'),
        "quot" => Ok('"'),
        "apos" => Ok('\''),
        other => Err(BzJiraError::Parse(format!(
            "Unsupported entity reference: &{};",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested() {
        let root = XmlElement::parse(
            r#"<bugzilla><bug><bug_id>42</bug_id><short_desc>A &amp; B</short_desc></bug></bugzilla>"#,
        )
        .unwrap();
        assert_eq!(root.name, "bugzilla");
        let bug = root.child("bug").unwrap();
        assert_eq!(bug.child_text("bug_id").as_deref(), Some("42"));
        assert_eq!(bug.child_text("short_desc").as_deref(), Some("A & B"));
    }

    #[test]
    fn test_parse_attrs_and_empty() {
        let root =
            XmlElement::parse(r#"<bug error="NotFound"><data encoding="base64"/></bug>"#).unwrap();
        assert_eq!(root.attr("error"), Some("NotFound"));
        assert_eq!(root.child("data").unwrap().attr("encoding"), Some("base64"));
    }

    #[test]
    fn test_namespace_stripping_and_find() {
        let root = XmlElement::parse(
            r#"<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/">
                 <SOAP-ENV:Body><ns1:mc_issue_getResponse><return><id>5</id></return></ns1:mc_issue_getResponse></SOAP-ENV:Body>
               </SOAP-ENV:Envelope>"#,
        )
        .unwrap();
        assert_eq!(root.name, "Envelope");
        let ret = root.find("return").unwrap();
        assert_eq!(ret.child_text("id").as_deref(), Some("5"));
    }

    #[test]
    fn test_repeated_children() {
        let root = XmlElement::parse(
            r#"<notes><item><id>1</id></item><item><id>2</id></item></notes>"#,
        )
        .unwrap();
        let ids: Vec<String> = root
            .children_named("item")
            .filter_map(|i| i.child_text("id"))
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_entity_and_char_references() {
        let root = XmlElement::parse(
            r#"<bug><short_desc>a &lt;b&gt; &amp; &quot;c&quot; &#233; &#x41;</short_desc></bug>"#,
        )
        .unwrap();
        assert_eq!(
            root.child_text("short_desc").as_deref(),
            Some("a <b> & \"c\" \u{e9} A")
        );
    }

    #[test]
    fn test_unknown_entity_is_error() {
        assert!(XmlElement::parse("<a>x &nbsp; y</a>").is_err());
    }

    #[test]
    fn test_unbalanced_is_error() {
        assert!(XmlElement::parse("<a><b></a>").is_err());
    }
}
