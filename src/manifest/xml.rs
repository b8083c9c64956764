// LoanLiberator - Library Loan Archiver
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Owned XML element tree with a single repair retry
//!
//! Decrypted manifests sometimes carry trailing NUL padding or bytes that
//! are not valid UTF-8. The strict pass rejects those; the repair pass
//! decodes lossily, strips NUL and U+FFFD, trims, and parses once more.

use crate::error::{LiberatorError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

/// One element with its resolved namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub namespace: Option<String>,
    pub local_name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    /// Attribute value by local name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Element matches `local_name` in `namespace`
    ///
    /// Elements without any namespace also match, since repaired documents
    /// occasionally lose their default namespace declaration.
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.local_name == local_name
            && self.namespace.as_deref().map_or(true, |ns| ns == namespace)
    }

    /// First descendant (document order) matching the name
    pub fn find(&self, namespace: &str, local_name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.is(namespace, local_name) {
                return Some(child);
            }
            if let Some(found) = child.find(namespace, local_name) {
                return Some(found);
            }
        }
        None
    }

    /// Every descendant matching the name, in document order
    pub fn find_all<'a>(&'a self, namespace: &str, local_name: &str) -> Vec<&'a XmlElement> {
        let mut found = Vec::new();
        self.collect(namespace, local_name, &mut found);
        found
    }

    fn collect<'a>(&'a self, namespace: &str, local_name: &str, out: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if child.is(namespace, local_name) {
                out.push(child);
            }
            child.collect(namespace, local_name, out);
        }
    }

    /// Trimmed text content, `None` when blank
    pub fn text_content(&self) -> Option<&str> {
        let text = self.text.trim();
        (!text.is_empty()).then_some(text)
    }
}

/// A parsed, well-formed document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDocument {
    pub root: XmlElement,
    /// Whether the repair pass was needed
    pub repaired: bool,
}

/// Parse, and on failure repair once and retry
///
/// # Errors
/// - `ManifestCorrupt` when the repaired text still does not parse
pub fn parse_or_repair(bytes: &[u8], document: &str) -> Result<XmlDocument> {
    let strict_error = match std::str::from_utf8(bytes) {
        Ok(text) => match parse_tree(text) {
            Ok(root) => return Ok(XmlDocument { root, repaired: false }),
            Err(reason) => reason,
        },
        Err(e) => format!("invalid UTF-8: {}", e),
    };

    tracing::warn!(document, error = %strict_error, "manifest did not parse, attempting repair");

    let repaired = repair_text(bytes);
    match parse_tree(&repaired) {
        Ok(root) => {
            tracing::info!(document, "manifest repaired");
            Ok(XmlDocument { root, repaired: true })
        }
        Err(reason) => Err(LiberatorError::manifest_corrupt(
            document,
            format!("{} (after repair: {})", strict_error, reason),
        )),
    }
}

/// Lossy decode, drop NUL and U+FFFD, trim
pub fn repair_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c != '\0' && c != char::REPLACEMENT_CHARACTER)
        .collect::<String>()
        .trim()
        .to_string()
}

fn parse_tree(text: &str) -> std::result::Result<XmlElement, String> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if let Some(c) = text.chars().find(|&c| !is_xml_char(c)) {
        return Err(format!("illegal character U+{:04X}", c as u32));
    }

    let mut reader = NsReader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let (namespace, event) = match reader.read_resolved_event() {
            Ok((ns, event)) => (namespace_uri(&ns), event),
            Err(e) => return Err(e.to_string()),
        };

        match event {
            Event::Start(start) => stack.push(element_from(namespace, &start)?),
            Event::Empty(start) => {
                let element = element_from(namespace, &start)?;
                attach(element, &mut stack, &mut root)?;
            }
            Event::End(_) => {
                let element = stack.pop().ok_or("unexpected closing tag")?;
                attach(element, &mut stack, &mut root)?;
            }
            Event::Text(t) => {
                let value = t.unescape().map_err(|e| e.to_string())?;
                match stack.last_mut() {
                    Some(current) => current.text.push_str(&value),
                    None if value.trim().is_empty() => {}
                    None => return Err("text outside the root element".to_string()),
                }
            }
            Event::CData(c) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(format!("unclosed element <{}>", open.local_name));
    }
    root.ok_or_else(|| "no root element".to_string())
}

fn attach(
    element: XmlElement,
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
) -> std::result::Result<(), String> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err("more than one root element".to_string()),
    }
    Ok(())
}

fn element_from(namespace: Option<String>, start: &BytesStart<'_>) -> std::result::Result<XmlElement, String> {
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
        attributes.push((key, value));
    }

    Ok(XmlElement {
        namespace,
        local_name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn namespace_uri(ns: &ResolveResult<'_>) -> Option<String> {
    match ns {
        ResolveResult::Bound(namespace) => Some(String::from_utf8_lossy(namespace.as_ref()).into_owned()),
        _ => None,
    }
}

/// XML 1.0 `Char` production
fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}
