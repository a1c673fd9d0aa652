//! Run-report sink: structured XML output for the execution report.
//!
//! # Design
//!
//! Workers and the driver emit report entries through a shared
//! [`ReportSink`]. The XML implementation holds a mutex only around the
//! actual write, so entries from different threads never interleave at the
//! byte level; ordering between threads is whatever lock acquisition gives.
//!
//! Nesting is tracked with an element stack so `push`/`pop` always produce
//! well-formed output. `flush` pushes buffered bytes to the OS; call it
//! after workers have quiesced for a complete document.

use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};

const INDENT: &str = "  ";

/// Thread-safe sink for the execution report.
///
/// Attribute values are always escaped; element text is escaped when the
/// `escape` argument asks for it (pre-formatted values like hex digests
/// pass `false`).
pub trait ReportSink: Send + Sync {
    /// Open a nested element.
    fn push(&self, tag: &str, attrs: &[(&str, &str)]);
    /// Close the innermost open element.
    fn pop(&self);
    /// Write a complete leaf element.
    fn xmlout(&self, tag: &str, text: &str, attrs: &[(&str, &str)], escape: bool);
    /// Write an XML comment.
    fn comment(&self, text: &str);
    /// Flush buffered output.
    fn flush(&self);
}

fn escape_xml(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

fn format_attrs(attrs: &[(&str, &str)], out: &mut String) {
    for (name, value) in attrs {
        out.push(' ');
        out.push_str(name);
        out.push_str("='");
        escape_xml(value, out);
        out.push('\'');
    }
}

struct XmlInner<W: Write> {
    out: BufWriter<W>,
    stack: Vec<String>,
}

/// XML report writer over any `Write` target.
pub struct XmlReport<W: Write + Send + 'static> {
    inner: Mutex<XmlInner<W>>,
}

impl<W: Write + Send + 'static> XmlReport<W> {
    pub fn new(out: W) -> Self {
        let mut out = BufWriter::new(out);
        // A failed report write cannot be reported anywhere better; fail fast.
        out.write_all(b"<?xml version='1.0' encoding='UTF-8'?>\n")
            .expect("report write failed");
        Self {
            inner: Mutex::new(XmlInner {
                out,
                stack: Vec::new(),
            }),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, XmlInner<W>> {
        self.inner.lock().expect("report mutex poisoned")
    }
}

impl<W: Write + Send + 'static> ReportSink for XmlReport<W> {
    fn push(&self, tag: &str, attrs: &[(&str, &str)]) {
        let mut line = String::new();
        format_attrs(attrs, &mut line);

        let mut g = self.locked();
        let depth = g.stack.len();
        for _ in 0..depth {
            g.out.write_all(INDENT.as_bytes()).expect("report write failed");
        }
        write!(g.out, "<{tag}{line}>").expect("report write failed");
        g.out.write_all(b"\n").expect("report write failed");
        g.stack.push(tag.to_string());
    }

    fn pop(&self) {
        let mut g = self.locked();
        let tag = g.stack.pop().expect("report pop without matching push");
        let depth = g.stack.len();
        for _ in 0..depth {
            g.out.write_all(INDENT.as_bytes()).expect("report write failed");
        }
        write!(g.out, "</{tag}>").expect("report write failed");
        g.out.write_all(b"\n").expect("report write failed");
    }

    fn xmlout(&self, tag: &str, text: &str, attrs: &[(&str, &str)], escape: bool) {
        let mut line = String::new();
        format_attrs(attrs, &mut line);
        let mut body = String::new();
        if escape {
            escape_xml(text, &mut body);
        } else {
            body.push_str(text);
        }

        let mut g = self.locked();
        let depth = g.stack.len();
        for _ in 0..depth {
            g.out.write_all(INDENT.as_bytes()).expect("report write failed");
        }
        if body.is_empty() {
            write!(g.out, "<{tag}{line}/>").expect("report write failed");
        } else {
            write!(g.out, "<{tag}{line}>{body}</{tag}>").expect("report write failed");
        }
        g.out.write_all(b"\n").expect("report write failed");
    }

    fn comment(&self, text: &str) {
        // "--" is not allowed inside XML comments.
        let sanitized = text.replace("--", "- -");
        let mut g = self.locked();
        let depth = g.stack.len();
        for _ in 0..depth {
            g.out.write_all(INDENT.as_bytes()).expect("report write failed");
        }
        write!(g.out, "<!-- {sanitized} -->").expect("report write failed");
        g.out.write_all(b"\n").expect("report write failed");
    }

    fn flush(&self) {
        self.locked().out.flush().expect("report flush failed");
    }
}

// ============================================================================
// BufferReport (for tests)
// ============================================================================

/// Shared in-memory write target.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .expect("buffer report mutex poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Report sink capturing the document in memory.
pub struct BufferReport {
    xml: XmlReport<SharedBuf>,
    buf: SharedBuf,
}

impl BufferReport {
    pub fn new() -> Self {
        let buf = SharedBuf::default();
        Self {
            xml: XmlReport::new(buf.clone()),
            buf,
        }
    }

    /// Current document contents. Flushes first, so this is complete up to
    /// the entries emitted so far.
    pub fn contents(&self) -> String {
        self.xml.flush();
        let g = self.buf.0.lock().expect("buffer report mutex poisoned");
        String::from_utf8_lossy(&g).into_owned()
    }
}

impl Default for BufferReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportSink for BufferReport {
    fn push(&self, tag: &str, attrs: &[(&str, &str)]) {
        self.xml.push(tag, attrs);
    }
    fn pop(&self) {
        self.xml.pop();
    }
    fn xmlout(&self, tag: &str, text: &str, attrs: &[(&str, &str)], escape: bool) {
        self.xml.xmlout(tag, text, attrs, escape);
    }
    fn comment(&self, text: &str) {
        self.xml.comment(text);
    }
    fn flush(&self) {
        self.xml.flush();
    }
}

/// Report sink that discards everything (benchmarks, silent runs).
pub struct NullReport;

impl ReportSink for NullReport {
    fn push(&self, _tag: &str, _attrs: &[(&str, &str)]) {}
    fn pop(&self) {}
    fn xmlout(&self, _tag: &str, _text: &str, _attrs: &[(&str, &str)], _escape: bool) {}
    fn comment(&self, _text: &str) {}
    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_elements_are_well_formed() {
        let report = BufferReport::new();
        report.push("runtime", &[("xmlns:debug", "urn:test")]);
        report.xmlout("note", "hello", &[], true);
        report.pop();

        let doc = report.contents();
        assert!(doc.contains("<runtime xmlns:debug='urn:test'>"));
        assert!(doc.contains("  <note>hello</note>"));
        assert!(doc.contains("</runtime>"));
    }

    #[test]
    fn attribute_values_are_escaped() {
        let report = BufferReport::new();
        report.xmlout("e", "", &[("v", "a<b&'c'")], true);
        let doc = report.contents();
        assert!(doc.contains("v='a&lt;b&amp;&apos;c&apos;'"));
    }

    #[test]
    fn text_escape_is_optional() {
        let report = BufferReport::new();
        report.xmlout("raw", "<keep/>", &[], false);
        report.xmlout("esc", "<no>", &[], true);
        let doc = report.contents();
        assert!(doc.contains("<raw><keep/></raw>"));
        assert!(doc.contains("<esc>&lt;no&gt;</esc>"));
    }

    #[test]
    fn empty_text_self_closes() {
        let report = BufferReport::new();
        report.xmlout("thread_wait", "", &[("thread", "0")], false);
        assert!(report.contents().contains("<thread_wait thread='0'/>"));
    }

    #[test]
    fn comments_never_contain_double_dash() {
        let report = BufferReport::new();
        report.comment("a--b");
        assert!(report.contents().contains("<!-- a- -b -->"));
    }

    #[test]
    #[should_panic(expected = "pop without matching push")]
    fn unbalanced_pop_panics() {
        let report = BufferReport::new();
        report.pop();
    }
}
