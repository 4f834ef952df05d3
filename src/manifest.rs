//! Manifest Parser.
//!
//! `imsmanifest.xml` is read into a small element tree with quick-xml, lifted
//! into a typed [`Manifest`] (organizations of group/leaf items plus the
//! resource table), and then walked in document order to produce the
//! launchable content objects.

use percent_encoding::percent_decode_str;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "imsmanifest.xml";

/// Schema versions accepted in `metadata/schemaversion`.
pub const SUPPORTED_VERSIONS: &[&str] = &[
    "1.2",
    "CAM 1.3",
    "2004 2nd Edition",
    "2004 3rd Edition",
    "2004 4th Edition",
];

/// Assumed when a manifest carries no `schemaversion` (common for 1.2 exports).
pub const DEFAULT_VERSION: &str = "1.2";

#[derive(Error, Debug, PartialEq)]
pub enum ManifestError {
    #[error("invalid manifest: {0}")]
    Invalid(String),
    #[error("unsupported schema version '{0}'")]
    UnsupportedVersion(String),
    #[error("no launchable items")]
    Empty,
}

/// One launchable item, in sequencing order.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentObjectDescriptor {
    pub identifier: String,
    pub title: String,
    pub ordinal: i32,
    pub entry_path: String,
    pub parameters: Option<String>,
    pub mastery_score: Option<f64>,
    pub prerequisites: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedManifest {
    pub identifier: String,
    pub title: String,
    pub schema_version: String,
    pub content_objects: Vec<ContentObjectDescriptor>,
}

/// Parses raw manifest bytes into ordered content-object descriptors.
pub fn parse_manifest(bytes: &[u8]) -> Result<ParsedManifest, ManifestError> {
    let root = parse_document(bytes)?;
    let manifest = Manifest::from_element(&root)?;

    let version = manifest
        .schema_version
        .clone()
        .unwrap_or_else(|| DEFAULT_VERSION.to_string());
    if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
        return Err(ManifestError::UnsupportedVersion(version));
    }

    let org = manifest.selected_organization().ok_or(ManifestError::Empty)?;
    let mut content_objects = Vec::new();
    collect_leaves(&org.items, &manifest.resources, &mut content_objects)?;
    if content_objects.is_empty() {
        return Err(ManifestError::Empty);
    }

    let title = org
        .title
        .clone()
        .unwrap_or_else(|| manifest.identifier.clone());

    Ok(ParsedManifest {
        identifier: manifest.identifier,
        title,
        schema_version: version,
        content_objects,
    })
}

// ------------- typed tree -------------

#[derive(Debug, Clone)]
pub struct Manifest {
    pub identifier: String,
    pub schema_version: Option<String>,
    pub default_organization: Option<String>,
    pub organizations: Vec<Organization>,
    pub resources: HashMap<String, Resource>,
}

#[derive(Debug, Clone)]
pub struct Organization {
    pub identifier: String,
    pub title: Option<String>,
    pub items: Vec<ItemNode>,
}

#[derive(Debug, Clone)]
pub enum ItemNode {
    /// Pure grouping node, no resource reference.
    Group {
        identifier: String,
        title: Option<String>,
        children: Vec<ItemNode>,
    },
    Leaf(LeafItem),
}

#[derive(Debug, Clone)]
pub struct LeafItem {
    pub identifier: String,
    pub title: Option<String>,
    pub identifierref: String,
    pub parameters: Option<String>,
    pub mastery_score: Option<f64>,
    pub prerequisites: Option<String>,
    /// 1.2 allows content on an item that also has children.
    pub children: Vec<ItemNode>,
}

#[derive(Debug, Clone, Default)]
pub struct Resource {
    pub identifier: String,
    pub href: Option<String>,
    /// Combined `xml:base` of `<resources>` and `<resource>`.
    pub base: String,
    pub files: Vec<String>,
}

impl Manifest {
    fn from_element(root: &Element) -> Result<Self, ManifestError> {
        if root.name != "manifest" {
            return Err(ManifestError::Invalid(format!(
                "root element is <{}>, expected <manifest>",
                root.name
            )));
        }

        let identifier = root.attr("identifier").unwrap_or_default().to_string();
        let schema_version = root
            .child("metadata")
            .and_then(|m| m.child_text("schemaversion"));

        let mut organizations = Vec::new();
        let mut default_organization = None;
        if let Some(orgs) = root.child("organizations") {
            default_organization = orgs.attr("default").map(str::to_string);
            for org in orgs.children_named("organization") {
                organizations.push(Organization {
                    identifier: org.attr("identifier").unwrap_or_default().to_string(),
                    title: org.child_text("title"),
                    items: org
                        .children_named("item")
                        .map(ItemNode::from_element)
                        .collect(),
                });
            }
        }

        let mut resources = HashMap::new();
        if let Some(res) = root.child("resources") {
            let outer_base = res.attr("base").unwrap_or_default();
            for r in res.children_named("resource") {
                let Some(id) = r.attr("identifier") else {
                    continue;
                };
                let base = format!("{}{}", outer_base, r.attr("base").unwrap_or_default());
                let files = r
                    .children_named("file")
                    .filter_map(|f| f.attr("href").map(str::to_string))
                    .collect();
                resources.insert(
                    id.to_string(),
                    Resource {
                        identifier: id.to_string(),
                        href: r.attr("href").map(str::to_string),
                        base,
                        files,
                    },
                );
            }
        }

        Ok(Self {
            identifier,
            schema_version,
            default_organization,
            organizations,
            resources,
        })
    }

    /// The organization named by `organizations@default`, else the first declared.
    pub fn selected_organization(&self) -> Option<&Organization> {
        self.default_organization
            .as_deref()
            .and_then(|def| self.organizations.iter().find(|o| o.identifier == def))
            .or_else(|| self.organizations.first())
    }
}

impl ItemNode {
    fn from_element(el: &Element) -> ItemNode {
        let identifier = el.attr("identifier").unwrap_or_default().to_string();
        let title = el.child_text("title");
        let children = el
            .children_named("item")
            .map(ItemNode::from_element)
            .collect();

        match el.attr("identifierref").filter(|r| !r.is_empty()) {
            Some(iref) => ItemNode::Leaf(LeafItem {
                identifier,
                title,
                identifierref: iref.to_string(),
                parameters: el.attr("parameters").map(str::to_string),
                mastery_score: mastery_score(el),
                prerequisites: el.child_text("prerequisites"),
                children,
            }),
            None => ItemNode::Group {
                identifier,
                title,
                children,
            },
        }
    }
}

fn mastery_score(item: &Element) -> Option<f64> {
    // SCORM 1.2: <adlcp:masteryscore>80</adlcp:masteryscore>
    if let Some(v) = item.child_text("masteryscore") {
        return v.parse().ok();
    }
    // SCORM 2004: primary objective satisfied by a normalized measure in [-1, 1]
    let objective = item
        .child("sequencing")?
        .child("objectives")?
        .child("primaryObjective")?;
    if objective.attr("satisfiedByMeasure") != Some("true") {
        return None;
    }
    let measure: f64 = objective.child_text("minNormalizedMeasure")?.parse().ok()?;
    Some(measure * 100.0)
}

fn collect_leaves(
    nodes: &[ItemNode],
    resources: &HashMap<String, Resource>,
    out: &mut Vec<ContentObjectDescriptor>,
) -> Result<(), ManifestError> {
    for node in nodes {
        match node {
            ItemNode::Group { children, .. } => collect_leaves(children, resources, out)?,
            ItemNode::Leaf(leaf) => {
                match resolve_entry(resources, &leaf.identifierref)? {
                    Some((entry_path, query)) => {
                        let ordinal = out.len() as i32;
                        out.push(ContentObjectDescriptor {
                            identifier: leaf.identifier.clone(),
                            title: leaf
                                .title
                                .clone()
                                .unwrap_or_else(|| leaf.identifier.clone()),
                            ordinal,
                            entry_path,
                            parameters: join_parameters(query, leaf.parameters.as_deref()),
                            mastery_score: leaf.mastery_score,
                            prerequisites: leaf.prerequisites.clone(),
                        });
                    }
                    None => {
                        tracing::debug!(
                            item = %leaf.identifier,
                            identifierref = %leaf.identifierref,
                            "item references no launchable resource, treating as group"
                        );
                    }
                }
                collect_leaves(&leaf.children, resources, out)?;
            }
        }
    }
    Ok(())
}

/// Entry path (relative to the package root) and href query for a resource.
fn resolve_entry(
    resources: &HashMap<String, Resource>,
    identifierref: &str,
) -> Result<Option<(String, Option<String>)>, ManifestError> {
    let Some(r) = resources.get(identifierref) else {
        return Ok(None);
    };
    // fallback: first <file href=...>
    let Some(href) = r.href.as_ref().or_else(|| r.files.first()) else {
        return Ok(None);
    };
    let (path, query) = match href.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (href.as_str(), None),
    };
    let full = format!("{}{}", r.base, path);
    let entry = normalize_path(&full)?;
    Ok(Some((entry, query.filter(|q| !q.is_empty()))))
}

fn join_parameters(query: Option<String>, parameters: Option<&str>) -> Option<String> {
    let params = parameters
        .map(|p| p.trim_start_matches(['?', '&']).to_string())
        .filter(|p| !p.is_empty());
    match (query, params) {
        (Some(q), Some(p)) => Some(format!("{q}&{p}")),
        (Some(q), None) => Some(q),
        (None, p) => p,
    }
}

/// Normalizes an href to a root-relative path, rejecting anything that
/// escapes the package root.
pub fn normalize_path(raw: &str) -> Result<String, ManifestError> {
    let raw = raw.split('#').next().unwrap_or_default();
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| ManifestError::Invalid(format!("href '{raw}' is not valid UTF-8")))?;
    normalize_decoded_path(&decoded)
}

/// Same checks as [`normalize_path`] for a path that is already
/// percent-decoded, such as a routed URL path.
pub fn normalize_decoded_path(decoded: &str) -> Result<String, ManifestError> {
    let decoded = decoded.replace('\\', "/");
    if decoded.starts_with('/') || decoded.contains("://") || has_drive_prefix(&decoded) {
        return Err(ManifestError::Invalid(format!(
            "href '{decoded}' is not relative to the package root"
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(ManifestError::Invalid(format!(
                    "href '{decoded}' escapes the package root"
                )))
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return Err(ManifestError::Invalid(format!("href '{decoded}' names no file")));
    }
    Ok(parts.join("/"))
}

fn has_drive_prefix(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

// ------------- element tree -------------

#[derive(Debug, Default)]
struct Element {
    /// Local name, namespace prefix stripped.
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn open(tag: &BytesStart<'_>) -> Result<Self, ManifestError> {
        let mut attrs = Vec::new();
        for a in tag.attributes() {
            let a = a.map_err(|e| ManifestError::Invalid(format!("bad attribute: {e}")))?;
            let key = String::from_utf8_lossy(a.key.as_ref()).to_string();
            let value = a
                .unescape_value()
                .map_err(|e| ManifestError::Invalid(format!("bad attribute value: {e}")))?
                .into_owned();
            attrs.push((strip_prefix(&key).to_string(), value));
        }
        Ok(Self {
            name: local_name(tag),
            attrs,
            ..Default::default()
        })
    }

    fn attr(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == local)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, local: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == local)
    }

    fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == local)
    }

    fn child_text(&self, local: &str) -> Option<String> {
        self.child(local)
            .map(|c| c.text.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// Bounds the element tree so the recursive walks over it stay shallow.
const MAX_DEPTH: usize = 64;

fn parse_document(bytes: &[u8]) -> Result<Element, ManifestError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(ManifestError::Invalid(format!(
                        "elements nested deeper than {MAX_DEPTH} levels"
                    )));
                }
                stack.push(Element::open(&e)?);
            }
            Ok(Event::Empty(e)) => {
                let el = Element::open(&e)?;
                attach(&mut stack, &mut root, el)?;
            }
            Ok(Event::End(_)) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| ManifestError::Invalid("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, el)?;
            }
            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| ManifestError::Invalid(format!("bad text: {e}")))?;
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ManifestError::Invalid(format!(
                    "malformed XML at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(ManifestError::Invalid("unexpected end of document".into()));
    }
    root.ok_or_else(|| ManifestError::Invalid("document has no root element".into()))
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    el: Element,
) -> Result<(), ManifestError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(el);
    } else if root.is_none() {
        *root = Some(el);
    } else {
        return Err(ManifestError::Invalid("multiple root elements".into()));
    }
    Ok(())
}

// ------------- helpers -------------

fn local_name(tag: &BytesStart<'_>) -> String {
    let full = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    strip_prefix(&full).to_string()
}

fn strip_prefix(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}
