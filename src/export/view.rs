//! Text tables for live display.

use std::io::{self, Write};

use crate::store::{Snapshot, Stack};
use crate::tree::Node;

const INDENT: usize = 2;

fn header<W: Write>(writer: &mut W) -> io::Result<()> {
    writeln!(writer, " {:>8} {:>8}  FUNCTION", "OWN", "TOT")
}

fn row<W: Write>(
    writer: &mut W,
    marker: char,
    own: u64,
    total: u64,
    depth: usize,
    label: &str,
) -> io::Result<()> {
    writeln!(
        writer,
        "{}{:>8} {:>8}  {:indent$}{}",
        marker,
        own,
        total,
        "",
        label,
        indent = depth * INDENT
    )
}

/// Print what every thread was last seen doing, one indented frame per line.
pub fn render_current<W: Write>(stacks: &[Stack], mut writer: W) -> io::Result<()> {
    header(&mut writer)?;
    for stack in stacks {
        writeln!(writer, "{}", stack.thread)?;
        if stack.frames.is_empty() {
            writeln!(writer, "{:>20}(idle)", "")?;
        }
        for (depth, frame) in stack.frames.iter().enumerate() {
            row(&mut writer, ' ', frame.own, frame.total, depth, &frame.label)?;
        }
    }
    Ok(())
}

/// Print a thread's whole call tree. Nodes on the active path are marked with `>`.
pub fn render_tree<W: Write>(snapshot: &Snapshot, mut writer: W) -> io::Result<()> {
    header(&mut writer)?;
    writeln!(writer, "{}", snapshot.thread)?;
    for root in snapshot.tree.roots() {
        render_node(&mut writer, root, 0)?;
    }
    Ok(())
}

fn render_node<W: Write>(writer: &mut W, node: &Node, depth: usize) -> io::Result<()> {
    let marker = if node.active { '>' } else { ' ' };
    row(writer, marker, node.own, node.total, depth, &node.label)?;
    for child in &node.children {
        render_node(writer, child, depth + 1)?;
    }
    Ok(())
}
