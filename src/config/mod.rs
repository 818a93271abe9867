//! Parses the `<arsenal>` XML configuration document into a raw node tree,
//! then materialises it into a live aggregation `Node` by connecting each
//! `<volume>` to its remote session.

use std::path::Path;
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader;
use thiserror::Error;

use crate::session::{SessionError, SftpSession, VolumeDescriptor};
use crate::tree::Node;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("unexpected end of document")]
    UnexpectedEof,
    #[error("root element must be <arsenal>")]
    WrongRoot,
    #[error("an aggregator (<mirror>/<distribute>) has no recognised children")]
    EmptyAggregator,
    #[error("configuration must declare exactly one top-level node under <arsenal>, found {0}")]
    NotExactlyOneRoot(usize),
    #[error("<volume> is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("<volume> field `port` is not a valid port number")]
    InvalidPort,
    #[error("failed to connect volume `{name}`: {source}")]
    Connect {
        name: String,
        #[source]
        source: SessionError,
    },
}

/// The tree shape as parsed, before any network I/O has happened.
enum RawNode {
    Volume(VolumeDescriptor),
    Mirror(Vec<RawNode>),
    Distribute(Vec<RawNode>),
}

/// Parse `path` and connect every declared volume, returning the live
/// aggregation tree rooted at the configuration's single top-level node.
pub fn load(path: &Path, mount_point: &str) -> Result<Node, ConfigError> {
    let xml = std::fs::read_to_string(path)?;
    let mut reader = Reader::from_str(&xml);
    let mut buf = Vec::new();

    let root_children = loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"arsenal" => {
                break parse_children(&mut reader)?;
            }
            Event::Eof => return Err(ConfigError::WrongRoot),
            _ => {}
        }
        buf.clear();
    };

    if root_children.len() != 1 {
        return Err(ConfigError::NotExactlyOneRoot(root_children.len()));
    }
    materialize(root_children.into_iter().next().unwrap(), mount_point)
}

/// Reads events until the `End` matching the element whose `Start` the
/// caller already consumed, collecting `volume`/`mirror`/`distribute`
/// children. Any other element name is skipped whole, per the documented
/// "unknown elements are ignored" rule.
fn parse_children(reader: &mut Reader<&[u8]>) -> Result<Vec<RawNode>, ConfigError> {
    let mut buf = Vec::new();
    let mut out = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"volume" => out.push(RawNode::Volume(parse_volume(reader)?)),
                    b"mirror" => out.push(RawNode::Mirror(parse_children(reader)?)),
                    b"distribute" => out.push(RawNode::Distribute(parse_children(reader)?)),
                    _ => {
                        reader.read_to_end_into(QName(&name), &mut Vec::new())?;
                    }
                }
            }
            Event::Empty(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"mirror" => out.push(RawNode::Mirror(Vec::new())),
                    b"distribute" => out.push(RawNode::Distribute(Vec::new())),
                    _ => {}
                }
            }
            Event::End(_) => return Ok(out),
            Event::Eof => return Err(ConfigError::UnexpectedEof),
            _ => {}
        }
        buf.clear();
    }
}

/// Reads a `<volume>` element's text-body children into a descriptor,
/// stopping at its matching `End`.
fn parse_volume(reader: &mut Reader<&[u8]>) -> Result<VolumeDescriptor, ConfigError> {
    let mut buf = Vec::new();
    let mut fields: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                current = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Event::Text(t) => {
                if let Some(field) = current.take() {
                    let text = t.unescape()?.trim().to_string();
                    fields.insert(field, text);
                }
            }
            Event::End(e) => {
                if e.name().as_ref() == b"volume" {
                    break;
                }
                current = None;
            }
            Event::Eof => return Err(ConfigError::UnexpectedEof),
            _ => {}
        }
        buf.clear();
    }

    let required = |key: &'static str| fields.get(key).cloned().ok_or(ConfigError::MissingField(key));

    Ok(VolumeDescriptor {
        name: required("name")?,
        root: fields.get("root").cloned().unwrap_or_default(),
        address: required("address")?,
        port: required("port")?.parse().map_err(|_| ConfigError::InvalidPort)?,
        public_key: fields.get("public_key").cloned(),
        private_key: fields.get("private_key").cloned(),
        username: required("username")?,
        passphrase: fields.get("passphrase").cloned(),
    })
}

fn materialize(raw: RawNode, mount_point: &str) -> Result<Node, ConfigError> {
    match raw {
        RawNode::Volume(descriptor) => {
            let name = descriptor.name.clone();
            let session = SftpSession::connect(&descriptor, mount_point)
                .map_err(|source| ConfigError::Connect { name: name.clone(), source })?;
            Ok(Node::volume(name, Arc::new(session)))
        }
        RawNode::Mirror(children) => {
            if children.is_empty() {
                return Err(ConfigError::EmptyAggregator);
            }
            let nodes = children
                .into_iter()
                .map(|c| materialize(c, mount_point))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Node::mirror(nodes))
        }
        RawNode::Distribute(children) => {
            if children.is_empty() {
                return Err(ConfigError::EmptyAggregator);
            }
            let nodes = children
                .into_iter()
                .map(|c| materialize(c, mount_point))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Node::distribute(nodes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(xml: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(xml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn rejects_non_arsenal_root() {
        let f = write_config("<notarsenal></notarsenal>");
        let err = load(f.path(), "/mnt").unwrap_err();
        assert!(matches!(err, ConfigError::WrongRoot));
    }

    #[test]
    fn rejects_empty_aggregator() {
        let f = write_config("<arsenal><mirror></mirror></arsenal>");
        let err = load(f.path(), "/mnt").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAggregator));
    }

    #[test]
    fn rejects_multiple_root_children() {
        let xml = r#"<arsenal>
            <volume><name>a</name><address>h</address><port>22</port><username>u</username></volume>
            <volume><name>b</name><address>h</address><port>22</port><username>u</username></volume>
        </arsenal>"#;
        let f = write_config(xml);
        let err = load(f.path(), "/mnt").unwrap_err();
        assert!(matches!(err, ConfigError::NotExactlyOneRoot(2)));
    }

    #[test]
    fn unknown_elements_inside_aggregator_are_ignored() {
        // A <mirror> with only an unrecognised child is the same as empty.
        let xml = "<arsenal><mirror><bogus/></mirror></arsenal>";
        let f = write_config(xml);
        let err = load(f.path(), "/mnt").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAggregator));
    }

    #[test]
    fn missing_required_volume_field_is_reported() {
        let xml = "<arsenal><volume><name>a</name></volume></arsenal>";
        let f = write_config(xml);
        let err = load(f.path(), "/mnt").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("address")));
    }
}
