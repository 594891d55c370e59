//! Regex-driven plugins for C, C++, Java, Python and a generic fallback

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use tokio::fs;
use tracing::warn;

use super::patch::{Position, CHEAT_PROTECTION};
use super::{LanguagePlugin, LineMap, Markers, ParseOutcome, PatchOptions, PatchOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Append {
    EndOfFile,
    /// Before the last closing brace
    InsideClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutableStyle {
    PrimaryFile,
    /// `package.Class` of the primary file
    JavaClass,
}

const C_FAMILY_SYMBOLS: &[&str] = &[
    r"\b([A-Za-z_]\w*)\s*\([^;{}()]*\)\s*(?:const\s*)?\{",
    r"\b(?:class|struct|enum|union)\s+([A-Za-z_]\w*)",
];

const KEYWORDS: &[&str] = &["if", "for", "while", "switch", "catch", "return", "sizeof"];

struct Profile {
    names: &'static [&'static str],
    /// Marks the file holding the entry point; the first source otherwise
    entry: Option<&'static str>,
    /// Two groups around the entry point's name
    main: &'static str,
    main_class: Option<&'static str>,
    print: &'static str,
    /// `{code}` and `{print}` are substituted
    catch: Option<&'static str>,
    exception_print: &'static str,
    main_function: &'static str,
    indent_blocks: bool,
    append: Append,
    executable: ExecutableStyle,
    symbols: &'static [&'static str],
}

pub(super) struct SourceLanguage {
    profile: Profile,
}

static C: SourceLanguage = SourceLanguage {
    profile: Profile {
        names: &["c"],
        entry: Some(r"\bmain\s*\("),
        main: r"(\s)main(\W)",
        main_class: None,
        print: r#"printf("{text}");"#,
        catch: None,
        exception_print: "",
        main_function: "int main() {\n{code}\nreturn 0;\n}\n",
        indent_blocks: false,
        append: Append::EndOfFile,
        executable: ExecutableStyle::PrimaryFile,
        symbols: C_FAMILY_SYMBOLS,
    },
};

static CPP: SourceLanguage = SourceLanguage {
    profile: Profile {
        names: &["c++", "cpp"],
        entry: Some(r"\bmain\s*\("),
        main: r"(\s)main(\W)",
        main_class: None,
        print: r#"std::cout << "{text}";"#,
        catch: Some("try {\n{code}\n} catch (...) {\n{print}\n}\n"),
        exception_print: r#"std::cout << "{text}";"#,
        main_function: "int main() {\n{code}\nreturn 0;\n}\n",
        indent_blocks: false,
        append: Append::EndOfFile,
        executable: ExecutableStyle::PrimaryFile,
        symbols: C_FAMILY_SYMBOLS,
    },
};

static JAVA: SourceLanguage = SourceLanguage {
    profile: Profile {
        names: &["java"],
        entry: Some(r"public\s+static\s+void\s+main"),
        main: r"(\spublic\s+static\s+void\s+)main(\W)",
        main_class: Some(r"\sclass\s"),
        print: r#"System.out.print("{text}");"#,
        catch: Some("try {\n{code}\n } catch (Exception e) {\n{print}}\n"),
        exception_print: r#"System.out.print("{text}" + e);"#,
        main_function: "public static void main(String[] args) {\n{code};\n}\n",
        indent_blocks: false,
        append: Append::InsideClass,
        executable: ExecutableStyle::JavaClass,
        symbols: C_FAMILY_SYMBOLS,
    },
};

static PYTHON: SourceLanguage = SourceLanguage {
    profile: Profile {
        names: &["python", "python3"],
        entry: None,
        main: r"(\s)main(\W)",
        main_class: None,
        print: r#"print("{text}", end="")"#,
        catch: Some("try:\n{code}\nexcept Exception as e:\n{print}\n"),
        exception_print: r#"print("{text}" + str(e), end="")"#,
        main_function: "if __name__ == \"__main__\":\n{code}\n",
        indent_blocks: true,
        append: Append::EndOfFile,
        executable: ExecutableStyle::PrimaryFile,
        symbols: &[r"(?m)^\s*(?:def|class)\s+([A-Za-z_]\w*)"],
    },
};

static GENERIC: SourceLanguage = SourceLanguage {
    profile: Profile {
        names: &[],
        entry: None,
        main: r"(\s)main(\W)",
        main_class: None,
        print: r#"print "{text}";"#,
        catch: None,
        exception_print: "",
        main_function: "main() {\n{code}\n}\n",
        indent_blocks: false,
        append: Append::EndOfFile,
        executable: ExecutableStyle::PrimaryFile,
        symbols: &[],
    },
};

static LANGUAGES: [&SourceLanguage; 4] = [&C, &CPP, &JAVA, &PYTHON];

pub(super) fn for_language(language: &str) -> &'static dyn LanguagePlugin {
    LANGUAGES
        .iter()
        .copied()
        .find(|l| {
            l.profile
                .names
                .iter()
                .any(|n| n.eq_ignore_ascii_case(language))
        })
        .unwrap_or(&GENERIC)
}

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .map_err(|e| warn!("Invalid pattern {}: {}", pattern, e))
        .ok()
}

async fn read_source(path: &Path) -> Option<String> {
    match fs::read(path).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn count_lines(text: &str) -> i64 {
    text.matches('\n').count() as i64
}

fn indent(code: &str) -> String {
    code.lines()
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Inserts `code` on its own lines above the line where `re` first matches
fn insert_above(source: &str, re: &Regex, code: &str, line_map: &mut LineMap) -> Option<String> {
    let caps = re.captures(source)?;
    let anchor = caps.get(1).or_else(|| caps.get(0))?;

    let bytes = source.as_bytes();
    let mut pos = anchor.start();
    while pos > 0 && !matches!(bytes[pos], b'\n' | b'\r') {
        pos -= 1;
    }

    let start = if pos == 0 { 1 } else { count_lines(&source[..pos]) + 2 };
    line_map.record(start, count_lines(code) + 2);
    Some(format!("{}\n{}\n{}", &source[..pos], code, &source[pos..]))
}

impl SourceLanguage {
    fn block(&self, code: &str) -> String {
        if self.profile.indent_blocks {
            indent(code)
        } else {
            code.to_string()
        }
    }

    fn print(&self, text: &str) -> String {
        self.profile.print.replace("{text}", text)
    }

    fn symbols(&self, source: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut symbols = Vec::new();
        for re in self.profile.symbols.iter().filter_map(|p| compile(p)) {
            for caps in re.captures_iter(source) {
                let name = &caps[1];
                if !KEYWORDS.contains(&name) && seen.insert(name.to_string()) {
                    symbols.push(name.to_string());
                }
            }
        }
        symbols
    }

    /// Returns the new source and the injected block as `(first line, count)`
    fn add_function(&self, source: &str, function: &str) -> (String, i64, i64) {
        let added = count_lines(function) + 2;
        match (self.profile.append, source.rfind('}')) {
            (Append::InsideClass, Some(pos)) => {
                let before = &source[..pos];
                // a brace alone on its line keeps it, one after code splits it
                let start = if before.is_empty() || before.ends_with('\n') {
                    count_lines(before) + 1
                } else {
                    count_lines(before) + 2
                };
                (
                    format!("{}\n{}\n{}", before, function, &source[pos..]),
                    start,
                    added,
                )
            }
            _ => (
                format!("{}\n{}\n", source, function),
                count_lines(source) + 2,
                added - 1,
            ),
        }
    }

    /// Renames the entry point and appends a new one running `code`
    fn patch_main(
        &self,
        source: &str,
        code: &str,
        options: &PatchOptions,
        markers: &Markers,
        line_map: &mut LineMap,
    ) -> Option<String> {
        let main = compile(self.profile.main)?;

        let symbols = self.symbols(source);
        let mut new_name = "_main".to_string();
        while source.contains(&new_name) || symbols.contains(&new_name) {
            new_name.insert(0, '_');
        }
        let mut patched = main
            .replace_all(source, format!("${{1}}{}${{2}}", new_name).as_str())
            .into_owned();

        let mut test_code = code.to_string();
        if options.use_markers {
            test_code = format!(
                "{}\n{}{}\n",
                self.print(&markers.start),
                test_code,
                self.print(&markers.end)
            );
        }
        if let (true, Some(catch)) = (options.try_catch, self.profile.catch) {
            let handler = self
                .profile
                .exception_print
                .replace("{text}", &markers.exception);
            test_code = catch
                .replace("{print}", &self.block(&handler))
                .replace("{code}", &self.block(&test_code));
        }
        let test_code = self
            .profile
            .main_function
            .replace("{code}", &self.block(&test_code));

        for marker in markers.all() {
            patched = patched.replace(marker, CHEAT_PROTECTION);
        }

        let (patched, start, added) = self.add_function(&patched, &test_code);
        line_map.record(start, added);
        Some(patched)
    }
}

#[async_trait]
impl LanguagePlugin for SourceLanguage {
    async fn find_primary_file(&self, sources: &[PathBuf]) -> Option<PathBuf> {
        let Some(pattern) = self.profile.entry else {
            return sources.first().cloned();
        };
        let entry = compile(pattern)?;
        for file in sources {
            if let Some(text) = read_source(file).await {
                if entry.is_match(&text) {
                    return Some(file.clone());
                }
            }
        }
        None
    }

    async fn find_executable(&self, sources: &[PathBuf]) -> Option<String> {
        let primary = self.find_primary_file(sources).await?;
        match self.profile.executable {
            ExecutableStyle::PrimaryFile => Some(primary.to_string_lossy().into_owned()),
            ExecutableStyle::JavaClass => {
                let text = read_source(&primary).await?;
                let package = compile(r"(?m)^\s*package\s+([\w.]+)\s*;")?
                    .captures(&text)
                    .map(|c| format!("{}.", &c[1]))
                    .unwrap_or_default();
                let class = compile(r"(?m)^\s*(?:public\s+)?(?:final\s+|abstract\s+)?class\s+(\w+)")?
                    .captures(&text)
                    .map(|c| c[1].to_string())?;
                Some(format!("{}{}", package, class))
            }
        }
    }

    async fn parse(&self, sources: &[PathBuf], options: &Map<String, Value>) -> ParseOutcome {
        let require = string_list(options.get("require_substrings"));
        let ban = string_list(options.get("ban_substrings"));
        let require_symbols = string_list(options.get("require_symbols"));
        let ban_symbols = string_list(options.get("ban_symbols"));
        let replacements = options.get("replace_substrings").and_then(Value::as_object);

        let mut found = HashSet::new();
        let mut all_symbols: Vec<String> = Vec::new();
        let fail = |message: String, symbols: &[String]| ParseOutcome {
            success: false,
            symbols: symbols.to_vec(),
            message: Some(message),
        };

        for file in sources {
            let Some(mut content) = read_source(file).await else {
                continue;
            };
            for s in &require {
                if content.contains(s.as_str()) {
                    found.insert(s.clone());
                }
            }
            if let Some(s) = ban.iter().find(|s| content.contains(s.as_str())) {
                return fail(format!("Found forbidden substring {}", s), &all_symbols);
            }
            if let Some(replacements) = replacements {
                for (from, to) in replacements {
                    content = content.replace(from.as_str(), to.as_str().unwrap_or_default());
                }
                if let Err(e) = fs::write(file, &content).await {
                    return fail(format!("Cannot rewrite {}: {}", file.display(), e), &all_symbols);
                }
            }
            for symbol in self.symbols(&content) {
                if !all_symbols.contains(&symbol) {
                    all_symbols.push(symbol);
                }
            }
        }

        if let Some(s) = require.iter().find(|s| !found.contains(*s)) {
            return fail(format!("Couldn't find substring {}", s), &all_symbols);
        }
        if let Some(s) = require_symbols.iter().find(|s| !all_symbols.contains(*s)) {
            return fail(format!("Couldn't find symbol {}", s), &all_symbols);
        }
        if let Some(s) = ban_symbols.iter().find(|s| all_symbols.contains(*s)) {
            return fail(format!("Found forbidden symbol {}", s), &all_symbols);
        }

        ParseOutcome {
            success: true,
            symbols: all_symbols,
            message: None,
        }
    }

    async fn patch(
        &self,
        sources: &[PathBuf],
        options: &PatchOptions,
        markers: &Markers,
        line_map: &mut LineMap,
    ) -> PatchOutcome {
        let Some(code) = options.code.as_deref() else {
            return PatchOutcome::done();
        };
        let Some(primary) = self.find_primary_file(sources).await else {
            return PatchOutcome::failed("Couldn't find main function");
        };

        let mut backup = primary.clone().into_os_string();
        backup.push(".patch-backup");
        let backup = PathBuf::from(backup);
        if !fs::try_exists(&backup).await.unwrap_or(false) {
            if let Err(e) = fs::copy(&primary, &backup).await {
                warn!("Failed to back up {}: {}", primary.display(), e);
            }
        }

        let Some(source) = read_source(&primary).await else {
            return PatchOutcome::failed("Couldn't read main file");
        };

        let patched = match options.position {
            Position::Main => self.patch_main(&source, code, options, markers, line_map),
            Position::AboveMain => {
                match compile(self.profile.main)
                    .and_then(|re| insert_above(&source, &re, code, line_map))
                {
                    Some(patched) => Some(patched),
                    None => return PatchOutcome::failed("Couldn't find main function"),
                }
            }
            Position::AboveMainClass => self
                .profile
                .main_class
                .and_then(compile)
                .and_then(|re| insert_above(&source, &re, code, line_map)),
            Position::TopOfFile => {
                line_map.record(1, count_lines(code) + 1);
                Some(format!("{}\n{}", code, source))
            }
        };

        let Some(patched) = patched else {
            return PatchOutcome::done();
        };
        match fs::write(&primary, patched).await {
            Ok(()) => PatchOutcome::done(),
            Err(e) => PatchOutcome::failed(format!("Couldn't write main file: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).await.unwrap();
        path
    }

    #[test]
    fn test_plugin_lookup() {
        assert!(std::ptr::eq(
            for_language("C++") as *const dyn LanguagePlugin as *const u8,
            &CPP as *const SourceLanguage as *const u8
        ));
        assert!(std::ptr::eq(
            for_language("cobol") as *const dyn LanguagePlugin as *const u8,
            &GENERIC as *const SourceLanguage as *const u8
        ));
    }

    #[test]
    fn test_primary_file_has_main() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let helper = write(dir.path(), "a.c", "int helper(int x) { return x; }\n").await;
            let main = write(dir.path(), "b.c", "int main() { return 0; }\n").await;

            let sources = vec![helper, main.clone()];
            assert_eq!(C.find_primary_file(&sources).await, Some(main));
        });
    }

    #[tokio::test]
    async fn test_java_executable_is_class_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "Main.java",
            "package ba.etf;\n\npublic class Hello {\n    public static void main(String[] args) {}\n}\n",
        )
        .await;

        assert_eq!(
            JAVA.find_executable(&[file]).await.as_deref(),
            Some("ba.etf.Hello")
        );
    }

    #[tokio::test]
    async fn test_parse_substrings_and_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "main.c",
            "#include <stdio.h>\nint sum(int a, int b) {\n return a + b;\n}\nint main() {\n if (1) { printf(\"%d\", sum(1, 2)); }\n}\n",
        )
        .await;
        let sources = vec![file];

        let outcome = C
            .parse(&sources, json!({"require_symbols": ["sum"]}).as_object().unwrap())
            .await;
        assert!(outcome.success);
        assert!(outcome.symbols.contains(&"sum".to_string()));
        assert!(outcome.symbols.contains(&"main".to_string()));
        assert!(!outcome.symbols.contains(&"if".to_string()));

        let outcome = C
            .parse(&sources, json!({"ban_substrings": ["printf"]}).as_object().unwrap())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("Found forbidden substring printf"));

        let outcome = C
            .parse(&sources, json!({"require_substrings": "scanf"}).as_object().unwrap())
            .await;
        assert_eq!(outcome.message.as_deref(), Some("Couldn't find substring scanf"));
    }

    #[tokio::test]
    async fn test_patch_main_with_markers() {
        let dir = tempfile::tempdir().unwrap();
        let original = "#include <iostream>\nint main() {\n  std::cout << \"====END_TEST_7====\";\n}";
        let file = write(dir.path(), "main.cpp", original).await;
        let options = PatchOptions {
            code: Some("std::cout << 6 * 7;".into()),
            use_markers: true,
            ..Default::default()
        };
        let mut line_map = LineMap::default();

        let outcome = CPP
            .patch(&[file.clone()], &options, &Markers::for_instance(7), &mut line_map)
            .await;
        assert!(outcome.success);

        let patched = fs::read_to_string(&file).await.unwrap();
        assert!(patched.contains("int _main() {"));
        assert!(patched.contains(CHEAT_PROTECTION));
        assert!(patched.contains("try {\nstd::cout << \"====START_TEST_7====\";"));
        assert!(patched.contains("catch (...) {\nstd::cout << \"====EXCEPTION_TEST_7====\";"));
        assert!(patched.trim_end().ends_with("return 0;\n}"));
        assert!(!line_map.is_empty());

        let backup = fs::read_to_string(dir.path().join("main.cpp.patch-backup"))
            .await
            .unwrap();
        assert_eq!(backup, original);
    }

    #[tokio::test]
    async fn test_patch_top_of_file_and_above_main() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "main.c", "int x;\nint main() {\n}\n").await;
        let mut line_map = LineMap::default();
        let markers = Markers::for_instance(1);

        let top = PatchOptions {
            position: Position::TopOfFile,
            code: Some("#include <math.h>".into()),
            ..Default::default()
        };
        assert!(C.patch(&[file.clone()], &top, &markers, &mut line_map).await.success);

        let above = PatchOptions {
            position: Position::AboveMain,
            code: Some("int helper() { return 1; }".into()),
            ..Default::default()
        };
        assert!(C.patch(&[file.clone()], &above, &markers, &mut line_map).await.success);

        let patched = fs::read_to_string(&file).await.unwrap();
        assert_eq!(
            patched,
            "#include <math.h>\nint x;\nint helper() { return 1; }\n\nint main() {\n}\n"
        );
        assert_eq!(line_map.remap(1), (1, true));
        assert_eq!(line_map.remap(2), (1, false));
        assert_eq!(line_map.remap(3), (1, true));
        assert_eq!(line_map.remap(5), (2, false));
    }

    #[tokio::test]
    async fn test_java_lines_after_injected_main_keep_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let original = "public class Main {\n    public static void main(String[] args) {\n    }\n}\n";
        let file = write(dir.path(), "Main.java", original).await;
        let options = PatchOptions {
            code: Some("int x = 1;".into()),
            try_catch: false,
            ..Default::default()
        };
        let mut line_map = LineMap::default();

        let outcome = JAVA
            .patch(&[file.clone()], &options, &Markers::for_instance(1), &mut line_map)
            .await;
        assert!(outcome.success);

        let patched = fs::read_to_string(&file).await.unwrap();
        let lines: Vec<&str> = patched.lines().collect();
        assert_eq!(lines[2], "    }");
        assert_eq!(lines[4], "public static void main(String[] args) {");
        assert_eq!(lines[8], "}");

        assert_eq!(line_map.remap(3), (3, false));
        assert_eq!(line_map.remap(6), (3, true));
        assert_eq!(line_map.remap(9), (4, false));
    }

    #[tokio::test]
    async fn test_patch_without_main_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "lib.c", "int f() { return 1; }\n").await;
        let options = PatchOptions {
            code: Some("f();".into()),
            ..Default::default()
        };

        let outcome = C
            .patch(&[file], &options, &Markers::for_instance(1), &mut LineMap::default())
            .await;
        assert!(!outcome.success);
    }
}
