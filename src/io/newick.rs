use anyhow::{Result, bail};

use crate::kernel::SCALER_NONE;
use crate::tree::{HalfEdge, NONE, Topology, TreeNumbers};

struct AstNode {
    children: Vec<AstNode>,
    label: Option<String>,
    length: f64,
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        match self.peek() {
            Some(got) if got == c => {
                self.pos += 1;
                Ok(())
            }
            got => bail!(
                "newick parse error at byte {}: expected {:?}, found {:?}",
                self.pos,
                c as char,
                got.map(|g| g as char)
            ),
        }
    }

    fn parse_label(&mut self) -> Option<String> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'(' | b')' | b',' | b':' | b';' | b'{' => break,
                c if c.is_ascii_whitespace() => break,
                _ => self.pos += 1,
            }
        }
        if self.pos > start {
            Some(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
        } else {
            None
        }
    }

    fn parse_length(&mut self) -> Result<f64> {
        if self.peek() != Some(b':') {
            return Ok(0.0);
        }
        self.pos += 1;
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E' => self.pos += 1,
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        let length: f64 = text
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid branch length {text:?} at byte {start}"))?;
        if length < 0.0 {
            bail!("negative branch length {length} at byte {start}");
        }
        Ok(length)
    }

    /// Consumes an optional `{n}` branch annotation, as emitted by the
    /// numbered newick writer.
    fn skip_annotation(&mut self) -> Result<()> {
        if self.peek() == Some(b'{') {
            while let Some(c) = self.bytes.get(self.pos).copied() {
                self.pos += 1;
                if c == b'}' {
                    return Ok(());
                }
            }
            bail!("unterminated {{...}} annotation in newick");
        }
        Ok(())
    }

    fn parse_clade(&mut self) -> Result<AstNode> {
        let mut children = Vec::new();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                children.push(self.parse_clade()?);
                match self.peek() {
                    Some(b',') => {
                        self.pos += 1;
                    }
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    got => bail!(
                        "newick parse error at byte {}: expected ',' or ')', found {:?}",
                        self.pos,
                        got.map(|g| g as char)
                    ),
                }
            }
        }
        let label = self.parse_label();
        let length = self.parse_length()?;
        self.skip_annotation()?;
        Ok(AstNode {
            children,
            label,
            length,
        })
    }
}

struct Builder {
    edges: Vec<HalfEdge>,
    tip_count: usize,
}

impl Builder {
    fn alloc(&mut self, length: f64, label: Option<String>) -> usize {
        self.edges.push(HalfEdge {
            twin: NONE,
            next: NONE,
            clv_index: usize::MAX,
            scaler_index: SCALER_NONE,
            pmatrix_index: 0,
            length,
            label,
        });
        self.edges.len() - 1
    }

    fn link_twins(&mut self, a: usize, b: usize, length: f64) {
        self.edges[a].twin = b;
        self.edges[b].twin = a;
        self.edges[a].length = length;
        self.edges[b].length = length;
    }

    /// Builds the arena below `node`, returning the half-edge at `node`
    /// pointing up toward its parent.
    fn descend(&mut self, node: &AstNode) -> Result<usize> {
        if node.children.is_empty() {
            let label = match &node.label {
                Some(l) => l.clone(),
                None => bail!("tip without a label in newick input"),
            };
            let up = self.alloc(node.length, Some(label));
            self.edges[up].clv_index = self.tip_count;
            self.tip_count += 1;
            return Ok(up);
        }
        if node.children.len() != 2 {
            bail!(
                "inner node with {} children: reference trees must be binary",
                node.children.len()
            );
        }
        let up = self.alloc(node.length, None);
        let mut downs = [0usize; 2];
        for (k, child) in node.children.iter().enumerate() {
            let child_up = self.descend(child)?;
            let down = self.alloc(child.length, None);
            self.link_twins(down, child_up, child.length);
            downs[k] = down;
        }
        self.edges[up].next = downs[0];
        self.edges[downs[0]].next = downs[1];
        self.edges[downs[1]].next = up;
        Ok(up)
    }
}

/// Parses a rooted or unrooted newick string into the half-edge arena. A
/// binary root is collapsed: its two incident edges merge into one branch.
pub fn parse_newick(text: &str) -> Result<Topology> {
    let mut parser = Parser::new(text);
    let root = parser.parse_clade()?;
    parser.expect(b';')?;

    let mut builder = Builder {
        edges: Vec::new(),
        tip_count: 0,
    };

    let root_edge = match root.children.len() {
        3 => {
            let mut downs = [0usize; 3];
            for (k, child) in root.children.iter().enumerate() {
                let child_up = builder.descend(child)?;
                let down = builder.alloc(child.length, None);
                builder.link_twins(down, child_up, child.length);
                downs[k] = down;
            }
            builder.edges[downs[0]].next = downs[1];
            builder.edges[downs[1]].next = downs[2];
            builder.edges[downs[2]].next = downs[0];
            downs[0]
        }
        2 => {
            let up_a = builder.descend(&root.children[0])?;
            let up_b = builder.descend(&root.children[1])?;
            let combined = root.children[0].length + root.children[1].length;
            builder.link_twins(up_a, up_b, combined);
            if !builder.edges[up_a].is_tip() {
                up_a
            } else if !builder.edges[up_b].is_tip() {
                up_b
            } else {
                bail!("reference tree needs at least 3 tips");
            }
        }
        n => bail!("newick root has {n} children, expected 2 or 3"),
    };

    let tips = builder.tip_count;
    if tips < 3 {
        bail!("reference tree needs at least 3 tips, found {tips}");
    }
    let mut edges = builder.edges;
    let inner = (edges.len() - tips) / 3;
    if inner != tips - 2 || edges.len() != tips + 3 * inner {
        bail!(
            "inconsistent tree structure: {} half-edges for {} tips",
            edges.len(),
            tips
        );
    }

    // oriented CLV and scaler indices: tips first, then three per inner node
    let mut node_count = 0usize;
    for h in 0..edges.len() {
        if edges[h].next == NONE || edges[h].clv_index != usize::MAX {
            continue;
        }
        let ring = [h, edges[h].next, edges[edges[h].next].next];
        for (k, &r) in ring.iter().enumerate() {
            let idx = tips + 3 * node_count + k;
            edges[r].clv_index = idx;
            edges[r].scaler_index = idx;
        }
        node_count += 1;
    }
    if node_count != inner {
        bail!("inner node ring walk found {node_count} nodes, expected {inner}");
    }

    Ok(Topology {
        edges,
        root: root_edge,
        nums: TreeNumbers::new(tips),
    })
}
