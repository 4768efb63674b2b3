//! Text and JSON serializers for the statistics summary.
//!
//! Both build the same DOM: a tree of named nodes carrying `(key, value)`
//! pairs. The two visitors differ only in the enter/exit/separator strings
//! they emit while walking it.

use std::fs;
use std::io;

use crate::tree::{Tree, TreeVisitor};

const INC_SPACES: usize = 2;

/// How a node aggregates its children in the JSON rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// `"name": { ... }`
    Object,
    /// `"name": [ ... ]`; children must be `ArrayElement`s.
    Array,
    /// Anonymous `{ ... }` inside an array.
    ArrayElement,
}

#[derive(Debug)]
struct DomVal {
    kind: NodeKind,
    name: String,
    vals: Vec<(String, String)>,
    depth: usize,
}

/// Sink-agnostic serializer facade shared by the text and JSON forms.
pub trait Serializer {
    /// Add a top-level node; returns its id for attaching children.
    fn serialize(&mut self, name: &str, vals: Vec<(String, String)>) -> usize;
    /// Add a node under `parent_id`.
    fn serialize_child(
        &mut self,
        parent_id: usize,
        name: &str,
        vals: Vec<(String, String)>,
    ) -> usize;
    /// Render the DOM and write it to the named file.
    fn sync(&mut self) -> io::Result<()>;
    /// Render the DOM and return the serialized form.
    fn serialized_data(&mut self) -> String;
}

/// Quote-and-indent text rendering.
pub struct TextSerializer {
    fname: String,
    tree: Tree<DomVal>,
    depths: Vec<usize>,
    sdata: String,
}

impl TextSerializer {
    pub fn new(fname: &str) -> Self {
        Self {
            fname: fname.to_string(),
            tree: Tree::new(),
            depths: vec![0],
            sdata: String::new(),
        }
    }
}

struct TextVisitor {
    out: String,
}

impl TreeVisitor<DomVal> for TextVisitor {
    fn enter_node(&mut self, val: &DomVal, _id: usize) {
        let pad = " ".repeat(val.depth * INC_SPACES);
        self.out.push_str(&format!("{pad}\"{}\":\n", val.name));
        let vpad = " ".repeat((val.depth + 1) * INC_SPACES);
        for (k, v) in &val.vals {
            self.out.push_str(&format!("{vpad}{k} : {v}\n"));
        }
    }
}

impl Serializer for TextSerializer {
    fn serialize(&mut self, name: &str, vals: Vec<(String, String)>) -> usize {
        let id = self.tree.add(DomVal {
            kind: NodeKind::Object,
            name: name.to_string(),
            vals,
            depth: 0,
        });
        self.depths.push(0);
        id
    }

    fn serialize_child(
        &mut self,
        parent_id: usize,
        name: &str,
        vals: Vec<(String, String)>,
    ) -> usize {
        let depth = self.depths[parent_id] + 1;
        let id = self.tree.add_child(
            parent_id,
            DomVal {
                kind: NodeKind::Object,
                name: name.to_string(),
                vals,
                depth,
            },
        );
        self.depths.push(depth);
        id
    }

    fn sync(&mut self) -> io::Result<()> {
        let data = self.serialized_data();
        fs::write(&self.fname, data)
    }

    fn serialized_data(&mut self) -> String {
        let mut vis = TextVisitor { out: String::new() };
        self.tree.dfs(&mut vis);
        self.sdata = vis.out;
        self.sdata.clone()
    }
}

/// JSON rendering over the same DOM.
pub struct JsonSerializer {
    fname: String,
    tree: Tree<DomVal>,
    depths: Vec<usize>,
    sdata: String,
}

impl JsonSerializer {
    pub fn new(fname: &str) -> Self {
        Self {
            fname: fname.to_string(),
            tree: Tree::new(),
            depths: vec![0],
            sdata: String::new(),
        }
    }

    /// Add an array node; children added with `serialize_element`.
    pub fn serialize_array(&mut self, parent_id: Option<usize>, name: &str) -> usize {
        let depth = parent_id.map_or(0, |p| self.depths[p] + 1);
        let val = DomVal {
            kind: NodeKind::Array,
            name: name.to_string(),
            vals: Vec::new(),
            depth,
        };
        let id = match parent_id {
            Some(p) => self.tree.add_child(p, val),
            None => self.tree.add(val),
        };
        self.depths.push(depth);
        id
    }

    /// Add one anonymous object under an array node.
    pub fn serialize_element(&mut self, array_id: usize, vals: Vec<(String, String)>) -> usize {
        let depth = self.depths[array_id] + 1;
        let id = self.tree.add_child(
            array_id,
            DomVal {
                kind: NodeKind::ArrayElement,
                name: String::new(),
                vals,
                depth,
            },
        );
        self.depths.push(depth);
        id
    }
}

struct JsonVisitor {
    out: String,
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

impl JsonVisitor {
    // Insert "," before a new construct when the previous sibling construct
    // (a pair, object, or array) has already been emitted.
    fn maybe_comma(&mut self) {
        let trimmed = self.out.trim_end_matches('\n');
        if matches!(trimmed.chars().last(), Some('"' | '}' | ']')) {
            let len = trimmed.len();
            self.out.truncate(len);
            self.out.push_str(",\n");
        }
    }
}

// Every value is emitted as a JSON string; the summary consumers treat the
// counters as opaque text.
impl TreeVisitor<DomVal> for JsonVisitor {
    fn begin(&mut self) {
        self.out.push_str("{\n");
    }

    fn enter_node(&mut self, val: &DomVal, _id: usize) {
        self.maybe_comma();
        let pad = " ".repeat((val.depth + 1) * INC_SPACES);
        match val.kind {
            NodeKind::Object => self
                .out
                .push_str(&format!("{pad}\"{}\": {{\n", json_escape(&val.name))),
            NodeKind::Array => self
                .out
                .push_str(&format!("{pad}\"{}\": [\n", json_escape(&val.name))),
            NodeKind::ArrayElement => self.out.push_str(&format!("{pad}{{\n")),
        }
        let vpad = " ".repeat((val.depth + 2) * INC_SPACES);
        for (i, (k, v)) in val.vals.iter().enumerate() {
            let sep = if i + 1 == val.vals.len() { "" } else { "," };
            self.out.push_str(&format!(
                "{vpad}\"{}\": \"{}\"{sep}\n",
                json_escape(k),
                json_escape(v)
            ));
        }
    }

    fn exit_node(&mut self, val: &DomVal, _id: usize) {
        let pad = " ".repeat((val.depth + 1) * INC_SPACES);
        match val.kind {
            NodeKind::Object | NodeKind::ArrayElement => self.out.push_str(&format!("{pad}}}\n")),
            NodeKind::Array => self.out.push_str(&format!("{pad}]\n")),
        }
    }

    fn end(&mut self) {
        let trimmed = self.out.trim_end_matches('\n').len();
        self.out.truncate(trimmed);
        self.out.push_str("\n}\n");
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&mut self, name: &str, vals: Vec<(String, String)>) -> usize {
        let id = self.tree.add(DomVal {
            kind: NodeKind::Object,
            name: name.to_string(),
            vals,
            depth: 0,
        });
        self.depths.push(0);
        id
    }

    fn serialize_child(
        &mut self,
        parent_id: usize,
        name: &str,
        vals: Vec<(String, String)>,
    ) -> usize {
        let depth = self.depths[parent_id] + 1;
        let id = self.tree.add_child(
            parent_id,
            DomVal {
                kind: NodeKind::Object,
                name: name.to_string(),
                vals,
                depth,
            },
        );
        self.depths.push(depth);
        id
    }

    fn sync(&mut self) -> io::Result<()> {
        let data = self.serialized_data();
        fs::write(&self.fname, data)
    }

    fn serialized_data(&mut self) -> String {
        let mut vis = JsonVisitor { out: String::new() };
        self.tree.dfs(&mut vis);
        self.sdata = vis.out;
        self.sdata.clone()
    }
}
