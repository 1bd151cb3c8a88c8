#![allow(dead_code)]

use std::io::{self, BufRead};

use ember::mojo::Writer;
use ember::sample::{Frame, Metrics, Sample};
use ember::tree::Node;
use pretty_assertions::assert_eq;

pub fn compare_results<R, E>(result: R, mut expected: E, expected_file: &str)
where
    R: BufRead,
    E: BufRead,
{
    let mut buf = String::new();
    let mut line_num = 1;
    for line in result.lines() {
        let line = line.unwrap();
        if expected.read_line(&mut buf).unwrap() == 0 {
            panic!(
                "\noutput has more lines than expected result file: {}",
                expected_file
            );
        }
        assert_eq!(line, buf.trim_end(), "\n{}:{}", expected_file, line_num);
        buf.clear();
        line_num += 1;
    }

    if expected.read_line(&mut buf).unwrap() > 0 {
        panic!(
            "\n{} has more lines than output, beginning at line: {}",
            expected_file, line_num
        )
    }
}

/// Encode a MOJO stream with the default format version.
pub fn mojo<F>(events: F) -> Vec<u8>
where
    F: FnOnce(&mut Writer<&mut Vec<u8>>) -> io::Result<()>,
{
    let mut bytes = Vec::new();
    {
        let mut writer = Writer::new(&mut bytes).unwrap();
        events(&mut writer).unwrap();
    }
    bytes
}

pub fn frame(name: &str) -> Frame {
    Frame::new(name, "app.py", 1)
}

pub fn sample(tid: &str, names: &[&str], value: i64) -> Sample {
    Sample {
        pid: Some(1),
        tid: tid.to_string(),
        frames: names.iter().map(|name| frame(name)).collect(),
        metrics: Metrics::Single(value),
    }
}

/// Check that every node's total is its own value plus its children's totals.
pub fn assert_additive(node: &Node) {
    let children: u64 = node.children.iter().map(|child| child.total).sum();
    assert_eq!(
        node.total,
        node.own + children,
        "totals do not add up at {}",
        node.label
    );
    for child in &node.children {
        assert_additive(child);
    }
}
