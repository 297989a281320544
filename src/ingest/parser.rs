//! Parser collaborator: content bytes in, entities and relationships out.
//!
//! Output ids are file-local so a cached result can be reused for any path
//! holding the same bytes. [`bind_to_path`] qualifies them afterwards.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ParseError;
use crate::models::{Entity, ParseOutput, Relationship};

/// Placeholder id for the file being parsed.
pub const FILE_ANCHOR: &str = "@file";

pub trait Parser: Send + Sync {
    /// Pure function of its inputs; runs on a blocking thread.
    fn parse(&self, content: &[u8], path: &str) -> Result<ParseOutput, ParseError>;
}

static RUST_DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(fn|struct|enum|trait)\s+([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});

static PY_DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?:async\s+)?(def|class)\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex")
});

static SQL_DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?im)^[ \t]*CREATE\s+(?:OR\s+REPLACE\s+)?(?:TEMP(?:ORARY)?\s+)?(TABLE|VIEW)\s+(?:IF\s+NOT\s+EXISTS\s+)?[`"\[]?([A-Za-z_][A-Za-z0-9_.]*)"#,
    )
    .expect("valid regex")
});

static RUST_DOC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^//!\s*(.+)$").expect("valid regex"));

static PY_DOC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:\s*#[^\n]*\n)*\s*(?:"""(?s:(.*?))"""|'''(?s:(.*?))''')"#).expect("valid regex")
});

/// Shallow top-level definition extractor for Rust, Python and SQL.
#[derive(Debug, Default, Clone)]
pub struct DefinitionParser;

impl DefinitionParser {
    pub fn new() -> Self {
        Self
    }

    fn language(path: &str) -> Option<&'static str> {
        let ext = std::path::Path::new(path).extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "rs" => Some("rust"),
            "py" | "pyi" => Some("python"),
            "sql" => Some("sql"),
            _ => None,
        }
    }
}

/// First lines of a module-level doc comment or docstring.
fn module_summary(text: &str, language: &str) -> Option<String> {
    let lines: Vec<String> = match language {
        "rust" => RUST_DOC_RE
            .captures_iter(text)
            .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
            .filter(|l| !l.is_empty())
            .take(3)
            .collect(),
        "python" => {
            let cap = PY_DOC_RE.captures(text)?;
            cap.get(1)
                .or_else(|| cap.get(2))?
                .as_str()
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .take(3)
                .map(String::from)
                .collect()
        }
        _ => Vec::new(),
    };
    (!lines.is_empty()).then(|| lines.join(" "))
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

impl Parser for DefinitionParser {
    fn parse(&self, content: &[u8], path: &str) -> Result<ParseOutput, ParseError> {
        let language = Self::language(path).ok_or_else(|| ParseError::Unsupported {
            path: path.to_string(),
            reason: "no parser for this file type".to_string(),
        })?;
        let text = std::str::from_utf8(content).map_err(|e| ParseError::Invalid {
            path: path.to_string(),
            reason: format!("not valid UTF-8: {}", e),
        })?;

        let re: &Regex = match language {
            "rust" => &RUST_DEF_RE,
            "python" => &PY_DEF_RE,
            _ => &SQL_DEF_RE,
        };

        let mut file = Entity::new(FILE_ANCHOR, "File")
            .with_property("language", language)
            .with_property("lines", text.lines().count());
        if let Some(summary) = module_summary(text, language) {
            file = file.with_property("summary", summary);
        }

        let mut output = ParseOutput::default();
        output.entities.push(file);

        for cap in re.captures_iter(text) {
            let (Some(kind), Some(name)) = (cap.get(1), cap.get(2)) else {
                continue;
            };
            let kind = kind.as_str().to_ascii_lowercase();
            let name = name.as_str();
            let local_id = format!("{}:{}", kind, name);
            if output.entities.iter().any(|e| e.id == local_id) {
                continue;
            }

            output.entities.push(
                Entity::new(&local_id, "Definition")
                    .with_property("name", name)
                    .with_property("kind", kind.as_str())
                    .with_property("line", line_of(text, cap.get(0).map_or(0, |m| m.start()))),
            );
            output
                .relationships
                .push(Relationship::new(FILE_ANCHOR, "DEFINES", local_id));
        }

        Ok(output)
    }
}

fn qualify(id: &str, path: &str) -> String {
    if id == FILE_ANCHOR {
        format!("file:{}", path)
    } else {
        format!("{}::{}", path, id)
    }
}

/// Rewrite file-local ids into graph-wide ids for `path`. Guarantees the
/// output contains the file entity itself.
pub fn bind_to_path(mut output: ParseOutput, path: &str) -> ParseOutput {
    for entity in &mut output.entities {
        entity.id = qualify(&entity.id, path);
    }
    for rel in &mut output.relationships {
        rel.source = qualify(&rel.source, path);
        rel.target = qualify(&rel.target, path);
    }

    let file_id = qualify(FILE_ANCHOR, path);
    if !output.entities.iter().any(|e| e.id == file_id) {
        output.entities.insert(0, Entity::new(&file_id, "File"));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_definitions() {
        let src = b"//! Order handling.\nuse std::fmt;\n\npub struct Order;\nenum State { A }\npub(crate) async fn submit() {}\nfn helper() {}\ntrait Store {}\n";
        let out = DefinitionParser::new().parse(src, "src/order.rs").unwrap();

        let ids: Vec<&str> = out.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![FILE_ANCHOR, "struct:Order", "enum:State", "fn:submit", "fn:helper", "trait:Store"]
        );
        assert_eq!(out.relationships.len(), 5);
        assert_eq!(out.entities[0].properties["summary"], "Order handling.");
        assert_eq!(out.entities[3].properties["line"], 6);
    }

    #[test]
    fn test_python_definitions_and_docstring() {
        let src = b"\"\"\"Billing jobs.\n\nRuns nightly.\n\"\"\"\nclass Invoice:\n    def total(self):\n        pass\n\ndef run():\n    pass\n";
        let out = DefinitionParser::new().parse(src, "jobs/billing.py").unwrap();

        let names: Vec<&str> = out.entities[1..]
            .iter()
            .map(|e| e.properties["name"].as_str().unwrap())
            .collect();
        // Methods are indented and therefore not top-level.
        assert_eq!(names, vec!["Invoice", "run"]);
        assert_eq!(out.entities[0].properties["summary"], "Billing jobs. Runs nightly.");
    }

    #[test]
    fn test_sql_tables_and_views() {
        let src = b"create table if not exists orders (id int);\nCREATE OR REPLACE VIEW \"recent_orders\" AS SELECT 1;\n";
        let out = DefinitionParser::new().parse(src, "schema/001.sql").unwrap();
        let ids: Vec<&str> = out.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![FILE_ANCHOR, "table:orders", "view:recent_orders"]);
    }

    #[test]
    fn test_unsupported_and_invalid_input() {
        let parser = DefinitionParser::new();
        assert!(matches!(
            parser.parse(b"x", "notes.txt"),
            Err(ParseError::Unsupported { .. })
        ));
        assert!(matches!(
            parser.parse(&[0xff, 0xfe, 0x00], "a.rs"),
            Err(ParseError::Invalid { .. })
        ));
    }

    #[test]
    fn test_bind_to_path_qualifies_every_id() {
        let out = DefinitionParser::new().parse(b"fn main() {}\n", "a/main.rs").unwrap();
        let bound = bind_to_path(out, "a/main.rs");

        assert_eq!(bound.entities[0].id, "file:a/main.rs");
        assert_eq!(bound.entities[1].id, "a/main.rs::fn:main");
        assert_eq!(bound.relationships[0].source, "file:a/main.rs");
        assert_eq!(bound.relationships[0].target, "a/main.rs::fn:main");
    }

    #[test]
    fn test_bind_to_path_adds_missing_file_entity() {
        let bound = bind_to_path(ParseOutput::default(), "x.sql");
        assert_eq!(bound.entities.len(), 1);
        assert_eq!(bound.entities[0].label, "File");
    }
}
