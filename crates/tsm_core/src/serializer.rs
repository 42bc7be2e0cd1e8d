//! Renders a mutated [`GroupTree`] back into the document as text substitutions.
//!
//! Only touched groups produce changes. Renames rewrite the entry key in place,
//! dirty item lists replace just their own table, deleted groups drop their
//! lines, and new entries are appended before the closing brace of the table
//! that should hold them. Everything else stays byte-for-byte as loaded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

use thiserror::Error;
use tracing::debug;

use crate::dialect::{AddressMap, AuxDefault, ItemListLocation, ItemListShape, KeyPath};
use crate::item::ItemEncoding;
use crate::layout::{ByteRange, ChangeSet, ChangeSetError, ChangeSpan};
use crate::scanner::{Document, Entry, Key, SpanId};
use crate::tree::{GroupNode, GroupPath, GroupTree};

const DEFAULT_INDENT: &str = "\t";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("`{0}` is missing from the document")]
    MissingRoot(String),
    #[error("`{path}` should be a table")]
    NotATable { path: String },
    #[error("rendered changes are inconsistent: {0}")]
    InvalidChanges(#[from] ChangeSetError),
}

/// A value written by this module. Existing text is never re-rendered
/// through it, only new or replaced tables.
#[derive(Debug, Clone, PartialEq)]
enum LuaValue {
    Table(Vec<Field>),
    Str(String),
    Int(i64),
    Bool(bool),
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    Keyed(String, LuaValue),
    Positional(LuaValue),
    /// A whole `key = value` entry copied from the original text.
    Verbatim(String),
}

pub fn render(doc: &Document, map: &AddressMap, tree: &GroupTree) -> Result<ChangeSet, RenderError> {
    let mut renderer = Renderer::new(doc, map);
    renderer.render_groups(tree)?;
    if renderer.has_changes() {
        renderer.ensure_aux_keys()?;
    }
    let changes = renderer.finish();
    changes.validate(doc.text())?;
    debug!(changes = changes.len(), "rendered change set");
    Ok(changes)
}

struct Renderer<'a> {
    doc: &'a Document,
    map: &'a AddressMap,
    style: Style,
    changes: Vec<ChangeSpan>,
    inserts: BTreeMap<SpanId, Vec<Field>>,
    /// Start offsets of entries being removed.
    removed: BTreeSet<usize>,
}

impl<'a> Renderer<'a> {
    fn new(doc: &'a Document, map: &'a AddressMap) -> Self {
        Self {
            doc,
            map,
            style: Style::detect(doc),
            changes: Vec::new(),
            inserts: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }

    fn has_changes(&self) -> bool {
        !self.changes.is_empty() || !self.inserts.is_empty()
    }

    fn render_groups(&mut self, tree: &GroupTree) -> Result<(), RenderError> {
        let doc = self.doc;
        let map = self.map;
        let group_entries = keyed_entries(doc, &map.group_container);
        let sibling_container = match &map.item_list {
            ItemListLocation::Sibling { container } => Some(container),
            ItemListLocation::InGroup { .. } => None,
        };
        let sibling_entries = sibling_container
            .map(|container| keyed_entries(doc, container))
            .unwrap_or_default();

        let live: BTreeSet<&GroupPath> = tree.groups().filter_map(GroupNode::origin).collect();
        for (origin, entry) in group_entries.iter().chain(sibling_entries.iter()) {
            if !live.contains(origin) {
                self.remove_entry(entry);
            }
        }

        for node in tree.groups() {
            let path = node.path();
            let Some(origin) = node.origin() else {
                if node.is_created() || node.items_dirty() {
                    self.insert_new_group(node)?;
                }
                continue;
            };
            let renamed = origin != path;

            match group_entries.get(origin) {
                Some(entry) => {
                    if renamed {
                        self.rename_entry(entry, path);
                    }
                    if node.items_dirty()
                        && let ItemListLocation::InGroup { key } = map.item_list
                    {
                        self.rewrite_group_items(entry, key, node)?;
                    }
                }
                None if renamed => {
                    let value = self.new_group_value(node);
                    self.insert_at(
                        &map.group_container,
                        Field::Keyed(path.as_str().to_string(), value),
                    )?;
                }
                None => {}
            }

            if let Some(container) = sibling_container {
                match sibling_entries.get(origin) {
                    Some(entry) => {
                        if renamed {
                            self.rename_entry(entry, path);
                        }
                        if node.items_dirty() {
                            let indent = doc.leading_indent(entry.range.start).to_string();
                            let table = self.items_table(node);
                            self.replace_value(entry, &table, &indent);
                        }
                    }
                    None if node.items_dirty() && has_entries(node) => {
                        let table = self.items_table(node);
                        self.insert_at(container, Field::Keyed(path.as_str().to_string(), table))?;
                    }
                    None => {}
                }
            }
        }

        Ok(())
    }

    fn insert_new_group(&mut self, node: &GroupNode) -> Result<(), RenderError> {
        let map = self.map;
        let key = node.path().as_str().to_string();
        let value = self.new_group_value(node);
        self.insert_at(&map.group_container, Field::Keyed(key.clone(), value))?;
        if let ItemListLocation::Sibling { container } = &map.item_list
            && has_entries(node)
        {
            let items = self.items_table(node);
            self.insert_at(container, Field::Keyed(key, items))?;
        }
        Ok(())
    }

    fn new_group_value(&self, node: &GroupNode) -> LuaValue {
        match self.map.item_list {
            ItemListLocation::InGroup { key } if has_entries(node) => {
                LuaValue::Table(vec![Field::Keyed(key.to_string(), self.items_table(node))])
            }
            _ => LuaValue::Table(Vec::new()),
        }
    }

    fn items_table(&self, node: &GroupNode) -> LuaValue {
        let encoding = self.map.encoding;
        let mut fields: Vec<Field> = node
            .items()
            .iter()
            .map(|&id| {
                let encoded = encoding.encode(id);
                match (self.map.item_shape, encoding) {
                    (ItemListShape::KeyedSet, _) => Field::Keyed(encoded, LuaValue::Bool(true)),
                    (ItemListShape::Array, ItemEncoding::BareId) => {
                        Field::Positional(LuaValue::Raw(encoded))
                    }
                    (ItemListShape::Array, _) => Field::Positional(LuaValue::Str(encoded)),
                }
            })
            .collect();
        // A keyed entry reusing an owned item's key would override it on load.
        let kept = node.foreign_entries().iter().filter(|foreign| {
            foreign
                .shadowed_item
                .is_none_or(|id| !node.items().contains(&id))
        });
        fields.extend(kept.map(|foreign| {
            if foreign.positional {
                Field::Positional(LuaValue::Raw(foreign.text.clone()))
            } else {
                Field::Verbatim(foreign.text.clone())
            }
        }));
        LuaValue::Table(fields)
    }

    fn rewrite_group_items(
        &mut self,
        group: &Entry,
        key: &str,
        node: &GroupNode,
    ) -> Result<(), RenderError> {
        let doc = self.doc;
        let table = group.table().ok_or_else(|| RenderError::NotATable {
            path: format!("{}.{}", self.map.group_container, node.path().as_str()),
        })?;
        let items = self.items_table(node);
        match doc.entry(table, key) {
            Some(entry) => {
                let indent = doc.leading_indent(entry.range.start).to_string();
                self.replace_value(entry, &items, &indent);
            }
            None => self
                .inserts
                .entry(table)
                .or_default()
                .push(Field::Keyed(key.to_string(), items)),
        }
        Ok(())
    }

    fn ensure_aux_keys(&mut self) -> Result<(), RenderError> {
        let map = self.map;
        for aux in &map.aux {
            let exists = aux
                .parent
                .resolve(self.doc)
                .and_then(|span| self.doc.entry(span, &aux.key))
                .is_some();
            if exists {
                continue;
            }
            let value = match aux.default {
                AuxDefault::EmptyTable => LuaValue::Table(Vec::new()),
                AuxDefault::Integer(n) => LuaValue::Int(n),
            };
            self.insert_at(&aux.parent, Field::Keyed(aux.key.clone(), value))?;
        }
        Ok(())
    }

    fn rename_entry(&mut self, entry: &Entry, path: &GroupPath) {
        if let Some(range) = entry.key_range {
            self.changes
                .push(ChangeSpan::replace(range, bracket_key(path.as_str())));
        }
    }

    fn replace_value(&mut self, entry: &Entry, value: &LuaValue, indent: &str) {
        let mut text = String::new();
        write_value(&mut text, value, indent, &self.style);
        self.changes
            .push(ChangeSpan::replace(entry.value_range, text));
    }

    fn remove_entry(&mut self, entry: &Entry) {
        self.removed.insert(entry.range.start);
        self.changes
            .push(ChangeSpan::delete(self.doc.removal_range(entry)));
    }

    /// Queues `field` for the table at `path`, creating missing tables on the way.
    fn insert_at(&mut self, path: &KeyPath, field: Field) -> Result<(), RenderError> {
        let doc = self.doc;
        let keys = path.keys();
        let Some((global, rest)) = keys.split_first() else {
            return Err(RenderError::MissingRoot(path.to_string()));
        };
        let mut span = doc
            .global(global)
            .and_then(Entry::table)
            .ok_or_else(|| RenderError::MissingRoot(global.clone()))?;

        let mut depth = 0;
        while let Some(key) = rest.get(depth) {
            let Some(entry) = doc.entry(span, key) else {
                break;
            };
            span = entry.table().ok_or_else(|| RenderError::NotATable {
                path: KeyPath::new(keys[..depth + 2].iter().cloned()).to_string(),
            })?;
            depth += 1;
        }

        let pending = self.inserts.entry(span).or_default();
        nest_field(pending, &rest[depth..], field);
        Ok(())
    }

    fn finish(mut self) -> ChangeSet {
        let inserts = std::mem::take(&mut self.inserts);
        for (span, fields) in inserts {
            self.flush_insert(span, &fields);
        }
        ChangeSet::new(self.changes)
    }

    fn flush_insert(&mut self, span_id: SpanId, fields: &[Field]) {
        let doc = self.doc;
        let span = doc.span(span_id);
        let open = span.range.start;
        let close = span.range.end - 1;

        let live_entries: Vec<&Entry> = span
            .entries
            .iter()
            .filter(|e| !self.removed.contains(&e.range.start))
            .collect();
        if let Some(last) = live_entries.last()
            && last.separator_end.is_none()
        {
            self.changes.push(ChangeSpan::insert(last.range.end, ","));
        }

        if let Some(close_indent) = doc.line_indent(close) {
            let entry_indent = live_entries
                .first()
                .and_then(|e| doc.line_indent(e.range.start))
                .map(str::to_string)
                .unwrap_or_else(|| format!("{close_indent}{}", self.style.unit));
            let mut text = String::new();
            write_fields(&mut text, fields, &entry_indent, &self.style);
            self.changes
                .push(ChangeSpan::insert(close - close_indent.len(), text));
            return;
        }

        let base = doc.leading_indent(open).to_string();
        let entry_indent = format!("{base}{}", self.style.unit);
        let mut text = String::from(self.style.newline);
        write_fields(&mut text, fields, &entry_indent, &self.style);
        text.push_str(&base);

        let inner = ByteRange::new(open + 1, close);
        if span.entries.is_empty() && doc.slice(inner).trim().is_empty() {
            self.changes.push(ChangeSpan::replace(inner, text));
        } else {
            self.changes.push(ChangeSpan::insert(close, text));
        }
    }
}

fn keyed_entries<'d>(doc: &'d Document, container: &KeyPath) -> HashMap<GroupPath, &'d Entry> {
    let Some(span) = container.resolve(doc) else {
        return HashMap::new();
    };
    doc.span(span)
        .entries
        .iter()
        .filter_map(|entry| match &entry.key {
            Key::Name(name) if !entry.positional => {
                GroupPath::parse(name).ok().map(|path| (path, entry))
            }
            _ => None,
        })
        .collect()
}

fn has_entries(node: &GroupNode) -> bool {
    !node.items().is_empty() || !node.foreign_entries().is_empty()
}

fn nest_field(fields: &mut Vec<Field>, missing: &[String], field: Field) {
    let Some((head, rest)) = missing.split_first() else {
        fields.push(field);
        return;
    };
    let existing = fields
        .iter()
        .position(|f| matches!(f, Field::Keyed(k, LuaValue::Table(_)) if k == head));
    match existing {
        Some(index) => {
            if let Field::Keyed(_, LuaValue::Table(inner)) = &mut fields[index] {
                nest_field(inner, rest, field);
            }
        }
        None => {
            let mut inner = Vec::new();
            nest_field(&mut inner, rest, field);
            fields.push(Field::Keyed(head.clone(), LuaValue::Table(inner)));
        }
    }
}

/// Indentation and line ending taken from the document being edited.
struct Style {
    unit: String,
    newline: &'static str,
}

impl Style {
    fn detect(doc: &Document) -> Self {
        let unit = doc
            .globals()
            .iter()
            .filter_map(Entry::table)
            .flat_map(|span| doc.span(span).entries.first())
            .find_map(|entry| doc.line_indent(entry.range.start).filter(|i| !i.is_empty()))
            .unwrap_or(DEFAULT_INDENT)
            .to_string();
        let newline = if doc.text().contains("\r\n") { "\r\n" } else { "\n" };
        Self { unit, newline }
    }
}

fn write_fields(out: &mut String, fields: &[Field], indent: &str, style: &Style) {
    let mut position = 0;
    for field in fields {
        out.push_str(indent);
        match field {
            Field::Keyed(key, value) => {
                out.push_str(&bracket_key(key));
                out.push_str(" = ");
                write_value(out, value, indent, style);
                out.push(',');
                out.push_str(style.newline);
            }
            Field::Positional(value) => {
                position += 1;
                write_value(out, value, indent, style);
                let _ = write!(out, ", -- [{position}]{}", style.newline);
            }
            Field::Verbatim(text) => {
                out.push_str(text);
                out.push(',');
                out.push_str(style.newline);
            }
        }
    }
}

fn write_value(out: &mut String, value: &LuaValue, indent: &str, style: &Style) {
    match value {
        LuaValue::Table(fields) => {
            out.push('{');
            out.push_str(style.newline);
            write_fields(out, fields, &format!("{indent}{}", style.unit), style);
            out.push_str(indent);
            out.push('}');
        }
        LuaValue::Str(s) => out.push_str(&quote(s)),
        LuaValue::Int(n) => {
            let _ = write!(out, "{n}");
        }
        LuaValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        LuaValue::Raw(text) => out.push_str(text),
    }
}

fn bracket_key(key: &str) -> String {
    format!("[{}]", quote(key))
}

/// Double-quoted Lua string literal, escaped the way the client writes them.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() => {
                let _ = write!(out, "\\{:03}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
