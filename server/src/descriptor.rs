//! XML descriptors: a gateway's topology file and the node-type reference file.
//!
//! Gateway descriptor layout (element names other than `node`, `nodetype_id`
//! and `location` are free-form and carried through as map keys):
//!
//! ```xml
//! <gateway>
//!   <location><building>A</building><floor>2</floor></location>
//!   <nodes>
//!     <node id="1">
//!       <nodetype_id>UNO</nodetype_id>
//!       <location><x>3</x><y>4</y></location>
//!     </node>
//!   </nodes>
//! </gateway>
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use roxmltree::{Document, Node};
use serde_json::{json, Map, Value};

use crate::models::NewNode;

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Failed to read descriptor: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("Missing element: {0}")]
    Missing(&'static str),
}

/// Parsed gateway topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDescriptor {
    pub location: BTreeMap<String, String>,
    pub nodes: Vec<NewNode>,
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn tag(node: Node<'_, '_>) -> String {
    node.tag_name().name().to_string()
}

fn text_of(node: Node<'_, '_>) -> String {
    node.text().map(str::trim).unwrap_or_default().to_string()
}

/// Children of `node` as a `tag -> text` map.
fn text_map(node: Node<'_, '_>) -> BTreeMap<String, String> {
    elements(node)
        .map(|child| (child.tag_name().name().to_string(), text_of(child)))
        .collect()
}

pub fn parse_gateway(xml: &str) -> Result<GatewayDescriptor, DescriptorError> {
    let doc = Document::parse(xml)?;
    let mut sections = elements(doc.root_element());
    let location = sections
        .next()
        .ok_or(DescriptorError::Missing("gateway location"))?;
    let nodes = sections.next().ok_or(DescriptorError::Missing("nodes"))?;

    let mut parsed = Vec::new();
    for node in elements(nodes) {
        let local_id = node
            .attribute("id")
            .ok_or(DescriptorError::Missing("node id"))?;
        let nodetype_id = elements(node)
            .find(|c| c.has_tag_name("nodetype_id"))
            .map(text_of)
            .ok_or(DescriptorError::Missing("nodetype_id"))?;
        let location = elements(node)
            .find(|c| c.has_tag_name("location"))
            .map(text_map)
            .unwrap_or_default();
        parsed.push(NewNode {
            local_id: local_id.to_string(),
            nodetype_id,
            location,
        });
    }

    Ok(GatewayDescriptor {
        location: text_map(location),
        nodes: parsed,
    })
}

pub fn read_gateway(path: &Path) -> Result<GatewayDescriptor, DescriptorError> {
    let xml = std::fs::read_to_string(path)?;
    parse_gateway(&xml)
}

/// Parse the node-type reference file into one JSON document per node type.
///
/// Each node type lists, in order: id, platform, processor, memory map, radio
/// map, sensors (name followed by measured types) and commands.
pub fn parse_node_types(xml: &str) -> Result<Vec<Value>, DescriptorError> {
    let document = Document::parse(xml)?;
    let mut node_types = Vec::new();

    for entry in elements(document.root_element()) {
        let fields: Vec<Node> = elements(entry).collect();
        if fields.len() < 7 {
            return Err(DescriptorError::Missing("node type field"));
        }
        let mut doc = Map::new();
        doc.insert(
            format!("_{}", fields[0].tag_name().name()),
            Value::String(text_of(fields[0])),
        );
        for field in &fields[1..3] {
            doc.insert(tag(*field), Value::String(text_of(*field)));
        }
        for field in &fields[3..5] {
            doc.insert(tag(*field), json!(text_map(*field)));
        }

        let sensors: Vec<Value> = elements(fields[5])
            .filter_map(|sensor| {
                let parts: Vec<Node> = elements(sensor).collect();
                let (name, types) = parts.split_first()?;
                let mut entry = Map::new();
                entry.insert(tag(*name), Value::String(text_of(*name)));
                if let Some(first) = types.first() {
                    let values = types.iter().map(|t| Value::String(text_of(*t))).collect();
                    entry.insert(tag(*first), Value::Array(values));
                }
                Some(Value::Object(entry))
            })
            .collect();
        doc.insert(tag(fields[5]), Value::Array(sensors));

        let commands: Vec<Value> = elements(fields[6])
            .map(|command| {
                let mut entry = Map::new();
                entry.insert(tag(command), Value::String(text_of(command)));
                Value::Object(entry)
            })
            .collect();
        doc.insert(tag(fields[6]), Value::Array(commands));

        node_types.push(Value::Object(doc));
    }

    Ok(node_types)
}

pub fn read_node_types(path: &Path) -> Result<Vec<Value>, DescriptorError> {
    let xml = std::fs::read_to_string(path)?;
    parse_node_types(&xml)
}
