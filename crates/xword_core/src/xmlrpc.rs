use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// An XML-RPC value as carried on the wire.
///
/// `DateTime` keeps the ISO8601 text opaque; servers disagree on the exact
/// shape and the callers treat timestamps as display strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Bool(bool),
    Str(String),
    Double(f64),
    DateTime(String),
    Base64(Vec<u8>),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            Value::DateTime(text) => Some(text),
            _ => None,
        }
    }

    /// Integer view; numeric strings count because some servers send ids and
    /// versions as `<string>` payloads.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(number) => Some(*number),
            Value::Str(text) => text.trim().parse::<i32>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(flag) => Some(*flag),
            Value::Str(text) => match text.trim() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(members) => Some(members),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Base64(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// A `<fault>` returned by the server: an application-level remote error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "XML-RPC fault {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Fault {}

/// Serializes a `<methodCall>` with positional parameters.
pub fn write_call(method: &str, params: &[Value]) -> String {
    let mut output = String::with_capacity(256);
    output.push_str("<?xml version=\"1.0\"?>");
    output.push_str("<methodCall><methodName>");
    output.push_str(&escape(method));
    output.push_str("</methodName><params>");
    for param in params {
        output.push_str("<param>");
        write_value(&mut output, param);
        output.push_str("</param>");
    }
    output.push_str("</params></methodCall>");
    output
}

fn write_value(output: &mut String, value: &Value) {
    output.push_str("<value>");
    match value {
        Value::Int(number) => {
            output.push_str("<int>");
            output.push_str(&number.to_string());
            output.push_str("</int>");
        }
        Value::Bool(flag) => {
            output.push_str("<boolean>");
            output.push(if *flag { '1' } else { '0' });
            output.push_str("</boolean>");
        }
        Value::Str(text) => {
            output.push_str("<string>");
            output.push_str(&escape(text));
            output.push_str("</string>");
        }
        Value::Double(number) => {
            output.push_str("<double>");
            output.push_str(&number.to_string());
            output.push_str("</double>");
        }
        Value::DateTime(text) => {
            output.push_str("<dateTime.iso8601>");
            output.push_str(&escape(text));
            output.push_str("</dateTime.iso8601>");
        }
        Value::Base64(bytes) => {
            output.push_str("<base64>");
            output.push_str(&STANDARD.encode(bytes));
            output.push_str("</base64>");
        }
        Value::Array(items) => {
            output.push_str("<array><data>");
            for item in items {
                write_value(output, item);
            }
            output.push_str("</data></array>");
        }
        Value::Struct(members) => {
            output.push_str("<struct>");
            for (name, member) in members {
                output.push_str("<member><name>");
                output.push_str(&escape(name));
                output.push_str("</name>");
                write_value(output, member);
                output.push_str("</member>");
            }
            output.push_str("</struct>");
        }
    }
    output.push_str("</value>");
}

/// Parses a `<methodResponse>` body. A `<fault>` surfaces as a [`Fault`]
/// error; callers downcast to distinguish it from transport failures.
pub fn parse_response(xml: &str) -> Result<Value> {
    let mut cursor = Cursor::new(xml);
    cursor.skip_declaration();
    cursor.expect("<methodResponse>")?;
    cursor.skip_whitespace();
    if cursor.starts_with("<fault>") {
        cursor.expect("<fault>")?;
        let payload = cursor.parse_value()?;
        cursor.skip_whitespace();
        cursor.expect("</fault>")?;
        let members = payload
            .as_struct()
            .ok_or_else(|| anyhow::anyhow!("XML-RPC fault payload is not a struct"))?;
        let code = members
            .get("faultCode")
            .and_then(Value::as_i32)
            .unwrap_or(0);
        let message = members
            .get("faultString")
            .and_then(Value::as_str)
            .unwrap_or("unknown fault")
            .to_string();
        return Err(Fault { code, message }.into());
    }
    cursor.expect("<params>")?;
    cursor.skip_whitespace();
    cursor.expect("<param>")?;
    let value = cursor.parse_value()?;
    cursor.skip_whitespace();
    cursor.expect("</param>")?;
    cursor.skip_whitespace();
    cursor.expect("</params>")?;
    cursor.skip_whitespace();
    cursor.expect("</methodResponse>")?;
    Ok(value)
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn starts_with(&self, literal: &str) -> bool {
        self.rest().starts_with(literal)
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    fn skip_declaration(&mut self) {
        self.skip_whitespace();
        if self.starts_with("<?xml") {
            if let Some(end) = self.rest().find("?>") {
                self.pos += end + 2;
            }
        }
        self.skip_whitespace();
    }

    fn expect(&mut self, literal: &str) -> Result<()> {
        self.skip_whitespace();
        if !self.starts_with(literal) {
            bail!(
                "malformed XML-RPC response: expected `{literal}` at offset {}",
                self.pos
            );
        }
        self.pos += literal.len();
        Ok(())
    }

    /// Raw text up to the next `<`, not consuming the bracket.
    fn take_text(&mut self) -> &'a str {
        let rest = self.rest();
        let end = rest.find('<').unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn scalar_text(&mut self, open: &str, close: &str) -> Result<String> {
        self.expect(open)?;
        let text = self.take_text().to_string();
        self.expect(close)?;
        Ok(text)
    }

    fn parse_value(&mut self) -> Result<Value> {
        self.expect("<value>")?;
        let text = self.take_text();
        if self.starts_with("</value>") {
            // Bare text is a string per the XML-RPC spec.
            self.expect("</value>")?;
            return Ok(Value::Str(unescape(text)?));
        }
        if !text.trim().is_empty() {
            bail!(
                "malformed XML-RPC response: mixed content at offset {}",
                self.pos
            );
        }

        let value = if self.starts_with("<string>") {
            Value::Str(unescape(&self.scalar_text("<string>", "</string>")?)?)
        } else if self.starts_with("<int>") {
            Value::Int(parse_number(&self.scalar_text("<int>", "</int>")?)?)
        } else if self.starts_with("<i4>") {
            Value::Int(parse_number(&self.scalar_text("<i4>", "</i4>")?)?)
        } else if self.starts_with("<boolean>") {
            let text = self.scalar_text("<boolean>", "</boolean>")?;
            match text.trim() {
                "1" | "true" => Value::Bool(true),
                "0" | "false" => Value::Bool(false),
                other => bail!("invalid XML-RPC boolean: {other}"),
            }
        } else if self.starts_with("<double>") {
            let text = self.scalar_text("<double>", "</double>")?;
            let number = text
                .trim()
                .parse::<f64>()
                .map_err(|_| anyhow::anyhow!("invalid XML-RPC double: {text}"))?;
            Value::Double(number)
        } else if self.starts_with("<dateTime.iso8601>") {
            Value::DateTime(self.scalar_text("<dateTime.iso8601>", "</dateTime.iso8601>")?)
        } else if self.starts_with("<base64>") {
            let text = self.scalar_text("<base64>", "</base64>")?;
            let compact = text
                .chars()
                .filter(|ch| !ch.is_whitespace())
                .collect::<String>();
            let bytes = STANDARD
                .decode(compact.as_bytes())
                .map_err(|error| anyhow::anyhow!("invalid XML-RPC base64 payload: {error}"))?;
            Value::Base64(bytes)
        } else if self.starts_with("<array>") {
            self.parse_array()?
        } else if self.starts_with("<struct>") {
            self.parse_struct()?
        } else {
            bail!(
                "unsupported XML-RPC value at offset {}",
                self.pos
            );
        };

        self.expect("</value>")?;
        Ok(value)
    }

    fn parse_array(&mut self) -> Result<Value> {
        self.expect("<array>")?;
        self.expect("<data>")?;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            if self.starts_with("</data>") {
                break;
            }
            items.push(self.parse_value()?);
        }
        self.expect("</data>")?;
        self.expect("</array>")?;
        Ok(Value::Array(items))
    }

    fn parse_struct(&mut self) -> Result<Value> {
        self.expect("<struct>")?;
        let mut members = BTreeMap::new();
        loop {
            self.skip_whitespace();
            if self.starts_with("</struct>") {
                break;
            }
            self.expect("<member>")?;
            self.expect("<name>")?;
            let name = unescape(self.take_text())?;
            self.expect("</name>")?;
            let value = self.parse_value()?;
            self.expect("</member>")?;
            members.insert(name, value);
        }
        self.expect("</struct>")?;
        Ok(Value::Struct(members))
    }
}

fn parse_number(text: &str) -> Result<i32> {
    text.trim()
        .parse::<i32>()
        .map_err(|_| anyhow::anyhow!("invalid XML-RPC integer: {text}"))
}

fn escape(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&apos;"),
            other => output.push(other),
        }
    }
    output
}

fn unescape(text: &str) -> Result<String> {
    if !text.contains('&') {
        return Ok(text.to_string());
    }
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(index) = rest.find('&') {
        output.push_str(&rest[..index]);
        rest = &rest[index..];
        let Some(end) = rest.find(';') else {
            bail!("unterminated XML entity in: {text}");
        };
        let entity = &rest[1..end];
        match entity {
            "amp" => output.push('&'),
            "lt" => output.push('<'),
            "gt" => output.push('>'),
            "quot" => output.push('"'),
            "apos" => output.push('\''),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(decimal) = entity.strip_prefix('#') {
                    decimal.parse::<u32>().ok()
                } else {
                    None
                };
                match code.and_then(char::from_u32) {
                    Some(ch) => output.push(ch),
                    None => bail!("unknown XML entity `&{entity};`"),
                }
            }
        }
        rest = &rest[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_call_serializes_positional_params() {
        let xml = write_call(
            "confluence1.login",
            &[
                Value::Str("Admin".to_string()),
                Value::Str("secret".to_string()),
            ],
        );
        assert_eq!(
            xml,
            "<?xml version=\"1.0\"?><methodCall><methodName>confluence1.login</methodName>\
             <params><param><value><string>Admin</string></value></param>\
             <param><value><string>secret</string></value></param></params></methodCall>"
        );
    }

    #[test]
    fn write_call_escapes_markup_in_strings() {
        let xml = write_call("confluence1.storePage", &[Value::Str("<b>&".to_string())]);
        assert!(xml.contains("<string>&lt;b&gt;&amp;</string>"));
    }

    #[test]
    fn parse_response_reads_scalar_string() {
        let value = parse_response(
            "<?xml version=\"1.0\"?><methodResponse><params><param>\
             <value><string>token123</string></value>\
             </param></params></methodResponse>",
        )
        .expect("parse");
        assert_eq!(value.as_str(), Some("token123"));
    }

    #[test]
    fn parse_response_reads_bare_text_as_string() {
        let value = parse_response(
            "<methodResponse><params><param><value>plain</value></param></params></methodResponse>",
        )
        .expect("parse");
        assert_eq!(value, Value::Str("plain".to_string()));
    }

    #[test]
    fn parse_response_reads_nested_array_of_structs() {
        let value = parse_response(
            "<methodResponse>\n  <params>\n    <param>\n      <value><array><data>\n\
             <value><struct>\
             <member><name>key</name><value><string>Main</string></value></member>\
             <member><name>version</name><value><int>3</int></value></member>\
             </struct></value>\n\
             </data></array></value>\n    </param>\n  </params>\n</methodResponse>",
        )
        .expect("parse");
        let items = value.as_array().expect("array");
        assert_eq!(items.len(), 1);
        let members = items[0].as_struct().expect("struct");
        assert_eq!(members.get("key").and_then(Value::as_str), Some("Main"));
        assert_eq!(members.get("version").and_then(Value::as_i32), Some(3));
    }

    #[test]
    fn parse_response_decodes_base64_payload() {
        let value = parse_response(
            "<methodResponse><params><param>\
             <value><base64>aGVsbG8=</base64></value>\
             </param></params></methodResponse>",
        )
        .expect("parse");
        assert_eq!(value.as_bytes(), Some(b"hello".as_slice()));
    }

    #[test]
    fn parse_response_surfaces_fault_as_typed_error() {
        let error = parse_response(
            "<methodResponse><fault><value><struct>\
             <member><name>faultCode</name><value><int>4</int></value></member>\
             <member><name>faultString</name><value><string>no such page</string></value></member>\
             </struct></value></fault></methodResponse>",
        )
        .expect_err("must fault");
        let fault = error.downcast_ref::<Fault>().expect("fault type");
        assert_eq!(fault.code, 4);
        assert_eq!(fault.message, "no such page");
    }

    #[test]
    fn parse_response_rejects_truncated_payload() {
        let error = parse_response("<methodResponse><params><param><value><string>oops")
            .expect_err("must fail");
        assert!(error.to_string().contains("malformed XML-RPC response"));
    }

    #[test]
    fn unescape_handles_named_and_numeric_entities() {
        assert_eq!(unescape("a &amp; b &#x41;&#66;").expect("unescape"), "a & b AB");
        assert!(unescape("broken &nope; here").is_err());
    }

    #[test]
    fn round_trip_preserves_struct_members() {
        let mut members = BTreeMap::new();
        members.insert("space".to_string(), Value::Str("Main".to_string()));
        members.insert("minorEdit".to_string(), Value::Bool(false));
        let xml = write_call("confluence1.storePage", &[Value::Struct(members.clone())]);
        let body = xml
            .replace("<methodCall>", "<methodResponse>")
            .replace("</methodCall>", "</methodResponse>")
            .replace("<methodName>confluence1.storePage</methodName>", "");
        let value = parse_response(&body).expect("parse");
        assert_eq!(value, Value::Struct(members));
    }
}
