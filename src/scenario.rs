//! Scenario loader: parses the fixed scenario XML schema into an in-memory
//! tree and exposes a hierarchical attribute query over it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::debug;

use crate::error::ScenarioError;

/// One element of the parsed scenario document, attributes already decoded.
#[derive(Debug, Clone, Default)]
pub struct ScenarioNode {
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub children: Vec<ScenarioNode>,
}

impl ScenarioNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ScenarioNode> {
        self.children.iter().filter(move |c| c.tag == tag)
    }
}

/// A loaded scenario document, rooted at `<scenario>`.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub root: ScenarioNode,
    /// Directory the scenario file lives in; relative `<import file="...">`
    /// paths resolve against this.
    pub base_dir: PathBuf,
}

/// Parses a scenario document from disk.
pub fn load(path: &Path) -> Result<Scenario, ScenarioError> {
    let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let root = parse_tree(&text, path)?;

    if root.tag != "scenario" {
        return Err(ScenarioError::WrongRoot {
            path: path.to_path_buf(),
            found: root.tag,
        });
    }

    let name = root
        .attr("name")
        .ok_or_else(|| ScenarioError::MissingAttribute {
            path: path.to_path_buf(),
            tag: "scenario".into(),
            attr: "name".into(),
        })?
        .to_string();
    let description = root.attr("description").unwrap_or("").to_string();

    debug!(scenario = %name, file = %path.display(), "loaded scenario document");

    Ok(Scenario {
        name,
        description,
        root,
        base_dir: path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    })
}

fn parse_tree(text: &str, path: &Path) -> Result<ScenarioNode, ScenarioError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<ScenarioNode> = Vec::new();
    let mut root: Option<ScenarioNode> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(|source| ScenarioError::Xml {
            path: path.to_path_buf(),
            source,
        })? {
            Event::Start(e) => {
                let node = new_node(&e, &reader, path)?;
                stack.push(node);
            }
            Event::Empty(e) => {
                let node = new_node(&e, &reader, path)?;
                push_finished(&mut stack, &mut root, node);
            }
            Event::End(_) => {
                let node = stack.pop().expect("well-formed XML guarantees a matching start");
                push_finished(&mut stack, &mut root, node);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| ScenarioError::WrongRoot {
        path: path.to_path_buf(),
        found: String::new(),
    })
}

fn push_finished(stack: &mut Vec<ScenarioNode>, root: &mut Option<ScenarioNode>, node: ScenarioNode) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    } else {
        *root = Some(node);
    }
}

fn new_node(
    e: &quick_xml::events::BytesStart,
    reader: &Reader<&[u8]>,
    path: &Path,
) -> Result<ScenarioNode, ScenarioError> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|source| ScenarioError::Xml {
            path: path.to_path_buf(),
            source: quick_xml::Error::InvalidAttr(source),
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|source| ScenarioError::Xml {
                path: path.to_path_buf(),
                source,
            })?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(ScenarioNode {
        tag,
        attrs,
        children: Vec::new(),
    })
}
