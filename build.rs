use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own sources.
const SOURCE_DIRS: [&str; 5] = ["analysis", "report", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

/// One source-hygiene rule: a line regex plus a filter deciding whether a
/// matched line is really a violation.
struct Rule {
    name: &'static str,
    pattern: String,
    accept: fn(&str) -> bool,
    advice: &'static str,
}

// Collects the violating lines of a single file.
struct Collector {
    accept: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for Collector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//!") {
        return Some(rest.trim());
    }
    line.find("//").map(|idx| line[idx + 2..].trim())
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// Underscore-prefixed identifiers in code, ignoring comments and string literals.
fn underscore_identifier(line: &str) -> bool {
    if line.trim_start().starts_with("//") {
        return false;
    }
    let code = line.split("//").next().unwrap_or("");
    let in_string = code
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !in_string
}

fn forbidden_word(line: &str) -> bool {
    comment_text(line).is_some_and(|text| {
        text.split(|c: char| !c.is_alphabetic())
            .any(|word| FORBIDDEN_WORDS.contains(&word))
    })
}

fn stars_outside_docs(line: &str) -> bool {
    !is_doc_comment(line) && comment_text(line).is_some_and(|text| text.contains("**"))
}

fn all_uppercase(line: &str) -> bool {
    comment_text(line).is_some_and(|text| {
        let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
        letters.peek().is_some() && letters.all(char::is_uppercase)
    })
}

fn always(line: &str) -> bool {
    !line.is_empty()
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed identifiers",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accept: underscore_identifier,
            advice: "Use the binding under its real name or remove it.",
        },
        Rule {
            name: "forbidden comment words",
            pattern: format!(r"//.*(?:{})", FORBIDDEN_WORDS.join("|")),
            accept: forbidden_word,
            advice: "Describe the code as it is, not how it got there.",
        },
        Rule {
            name: "'**' in regular comments",
            pattern: r"//.*\*\*".to_string(),
            accept: stars_outside_docs,
            advice: "Markdown emphasis belongs in doc comments only.",
        },
        Rule {
            name: "all-uppercase comments",
            pattern: r"//.*".to_string(),
            accept: all_uppercase,
            advice: "Write comments in sentence case or delete them.",
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accept: always,
            advice: "Use the code or remove it.",
        },
        Rule {
            name: "block comments",
            pattern: r"/\*".to_string(),
            accept: |line| !line.contains('"'),
            advice: "Use line comments.",
        },
    ]
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check(rule: &Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = Collector {
            accept: rule.accept,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            let mut message = format!(
                "\n❌ ERROR: Found {} {} in {}:\n",
                collector.violations.len(),
                rule.name,
                path.display()
            );
            for violation in &collector.violations {
                message.push_str(&format!("   {violation}\n"));
            }
            message.push_str(&format!("\n⚠️ {}\n", rule.advice));
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let files = source_files();
    for rule in rules() {
        if let Err(e) = check(&rule, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
