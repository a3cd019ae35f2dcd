//! SWC compiler backend.
//!
//! Parses JS/TS/JSX, strips types, lowers JSX and re-emits an ES module.
//! Import and export statements are left alone so the dev server can rewrite
//! their specifiers afterwards.

#![allow(clippy::default_trait_access)]

use super::spec::{JsxRuntime, SourceMapKind};
use super::{CompilerBackend, CompilerError, Diagnostic, TranspileOutput, TranspileSpec};
use base64::Engine as _;

/// SWC-based compiler backend.
///
/// `SwcBackend` is `Send + Sync`; each `transpile` call builds its own
/// source map and globals.
#[derive(Debug, Clone, Default)]
pub struct SwcBackend {
    _private: (),
}

impl SwcBackend {
    #[must_use]
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn is_typescript(ext: &str) -> bool {
        matches!(ext, "ts" | "tsx")
    }

    fn is_jsx(ext: &str) -> bool {
        matches!(ext, "jsx" | "tsx")
    }
}

impl CompilerBackend for SwcBackend {
    fn name(&self) -> &'static str {
        "swc"
    }

    fn transpile(
        &self,
        spec: &TranspileSpec,
        source: &str,
    ) -> Result<TranspileOutput, CompilerError> {
        let ext = spec.extension();
        if !self.supports_extension(&ext) {
            return Err(CompilerError::unsupported_file(format!(
                "cannot transpile {}",
                spec.input_path.display()
            )));
        }
        if source.trim().is_empty() {
            return Ok(TranspileOutput::new(""));
        }

        compile_with_swc(spec, source, Self::is_typescript(&ext), Self::is_jsx(&ext))
    }
}

fn compile_with_swc(
    spec: &TranspileSpec,
    source: &str,
    is_ts: bool,
    is_jsx: bool,
) -> Result<TranspileOutput, CompilerError> {
    use swc_common::{
        comments::SingleThreadedComments, sync::Lrc, FileName, Globals, Mark, SourceMap, Spanned,
        GLOBALS,
    };
    use swc_ecma_ast::{EsVersion, Program};
    use swc_ecma_codegen::{text_writer::JsWriter, Emitter};
    use swc_ecma_parser::{lexer::Lexer, EsSyntax, Parser, StringInput, Syntax, TsSyntax};
    use swc_ecma_transforms_base::{fixer::fixer, hygiene::hygiene, resolver};
    use swc_ecma_transforms_react::{react, Options as ReactOptions, Runtime};
    use swc_ecma_transforms_typescript::strip;
    use swc_ecma_visit::FoldWith;

    let cm: Lrc<SourceMap> = Default::default();

    let filename = spec
        .input_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("module.js")
        .to_string();
    let fm = cm.new_source_file(
        Lrc::new(FileName::Custom(filename)),
        source.to_string(),
    );

    let syntax = if is_ts {
        Syntax::Typescript(TsSyntax {
            tsx: is_jsx,
            decorators: true,
            ..Default::default()
        })
    } else {
        Syntax::Es(EsSyntax {
            jsx: is_jsx,
            decorators: true,
            ..Default::default()
        })
    };

    let comments = SingleThreadedComments::default();
    let lexer = Lexer::new(
        syntax,
        EsVersion::EsNext,
        StringInput::from(&*fm),
        Some(&comments),
    );
    let mut parser = Parser::new_from(lexer);

    let to_diagnostic = |message: String, span: swc_common::Span| {
        let loc = cm.lookup_char_pos(span.lo);
        Diagnostic::error(message).with_location(
            spec.input_path.clone(),
            loc.line as u32,
            loc.col_display as u32 + 1,
        )
    };

    let module = parser.parse_module().map_err(|e| {
        let message = e.kind().msg().to_string();
        let diag = to_diagnostic(message.clone(), e.span());
        CompilerError::parse_error(message).with_diagnostics(vec![diag])
    })?;

    let recovered: Vec<Diagnostic> = parser
        .take_errors()
        .into_iter()
        .map(|e| to_diagnostic(e.kind().msg().to_string(), e.span()))
        .collect();
    if let Some(first) = recovered.first() {
        return Err(CompilerError::parse_error(first.message.clone()).with_diagnostics(recovered));
    }

    let output = GLOBALS.set(&Globals::default(), || {
        let unresolved_mark = Mark::new();
        let top_level_mark = Mark::new();

        let mut program = Program::Module(module);
        program = program.fold_with(&mut resolver(unresolved_mark, top_level_mark, is_ts));
        if is_ts {
            program = program.fold_with(&mut strip(unresolved_mark, top_level_mark));
        }

        let mut module = match program {
            Program::Module(m) => m,
            Program::Script(s) => swc_ecma_ast::Module {
                span: s.span,
                body: s
                    .body
                    .into_iter()
                    .map(swc_ecma_ast::ModuleItem::Stmt)
                    .collect(),
                shebang: s.shebang,
            },
        };

        if is_jsx {
            let runtime = match spec.jsx_runtime {
                JsxRuntime::Automatic => Runtime::Automatic,
                JsxRuntime::Classic => Runtime::Classic,
            };
            let options = ReactOptions {
                runtime: Some(runtime),
                import_source: Some("react".to_string()),
                ..Default::default()
            };
            module = module.fold_with(&mut react(
                cm.clone(),
                Some(&comments),
                options,
                top_level_mark,
                unresolved_mark,
            ));
        }

        module = module.fold_with(&mut hygiene());
        module.fold_with(&mut fixer(Some(&comments)))
    });

    let mut buf = Vec::new();
    let mut src_map_buf = Vec::new();
    {
        let wants_map = !matches!(spec.sourcemaps, SourceMapKind::None);
        let writer = JsWriter::new(
            cm.clone(),
            "\n",
            &mut buf,
            wants_map.then_some(&mut src_map_buf),
        );
        let mut emitter = Emitter {
            cfg: swc_ecma_codegen::Config::default().with_target(EsVersion::EsNext),
            cm: cm.clone(),
            comments: Some(&comments),
            wr: writer,
        };
        emitter
            .emit_module(&output)
            .map_err(|e| CompilerError::transform_error(format!("Failed to emit: {e}")))?;
    }

    let mut code = String::from_utf8(buf)
        .map_err(|e| CompilerError::transform_error(format!("Invalid UTF-8 output: {e}")))?;

    if matches!(spec.sourcemaps, SourceMapKind::None) {
        return Ok(TranspileOutput::new(code));
    }

    let mut map_buf = Vec::new();
    cm.build_source_map(&src_map_buf)
        .to_writer(&mut map_buf)
        .map_err(|e| CompilerError::transform_error(format!("Failed to write source map: {e}")))?;

    match spec.sourcemaps {
        SourceMapKind::Inline => {
            if !code.ends_with('\n') {
                code.push('\n');
            }
            code.push_str("//# sourceMappingURL=data:application/json;base64,");
            code.push_str(&base64::engine::general_purpose::STANDARD.encode(&map_buf));
            code.push('\n');
            Ok(TranspileOutput::new(code))
        }
        _ => {
            let map = String::from_utf8(map_buf).map_err(|e| {
                CompilerError::transform_error(format!("Invalid UTF-8 source map: {e}"))
            })?;
            Ok(TranspileOutput::new(code).with_source_map(map))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn transpile(file: &str, source: &str) -> TranspileOutput {
        SwcBackend::new()
            .transpile(&TranspileSpec::new(file), source)
            .unwrap()
    }

    #[test]
    fn test_swc_backend_name() {
        assert_eq!(SwcBackend::new().name(), "swc");
    }

    #[test]
    fn test_transpile_empty_source() {
        assert_eq!(transpile("app.ts", "  \n").code, "");
    }

    #[test]
    fn test_transpile_simple_js() {
        let output = transpile("app.js", "const x = 1;");
        assert!(output.code.contains("const x = 1;"));
        assert!(output.source_map.is_none());
    }

    #[test]
    fn test_imports_survive_untouched() {
        let output = transpile(
            "main.js",
            "import React from 'react';\nimport './index.css';\nexport { a } from \"./a.js\";\nconsole.log(React);",
        );
        assert!(output.code.contains("from 'react'") || output.code.contains("from \"react\""));
        assert!(output.code.contains("index.css"));
        assert!(output.code.contains("./a.js"));
    }

    #[test]
    fn test_transpile_typescript() {
        let output = transpile(
            "app.ts",
            r#"
            interface User { name: string; age: number; }
            const user: User = { name: "Alice", age: 30 };
            console.log(user.name);
            "#,
        );
        assert!(!output.code.contains("interface"));
        assert!(!output.code.contains(": User"));
        assert!(output.code.contains("const user"));
        assert!(output.code.contains("console.log"));
    }

    #[test]
    fn test_transpile_jsx_automatic() {
        let output = transpile(
            "App.jsx",
            r#"export default function App() { return <div className="app">Hello</div>; }"#,
        );
        assert!(output.code.contains("react/jsx-runtime"), "{}", output.code);
        assert!(!output.code.contains("<div"));
    }

    #[test]
    fn test_transpile_jsx_classic() {
        let spec = TranspileSpec::new("App.jsx").with_jsx_runtime(JsxRuntime::Classic);
        let output = SwcBackend::new()
            .transpile(&spec, "function App() { return <div>Hello</div>; }")
            .unwrap();
        assert!(output.code.contains("createElement"));
        assert!(!output.code.contains("jsx-runtime"));
    }

    #[test]
    fn test_transpile_tsx() {
        let output = transpile(
            "App.tsx",
            "interface Props { name: string }\nexport function Greeting({ name }: Props) { return <h1>Hi {name}</h1>; }",
        );
        assert!(!output.code.contains("interface"));
        assert!(!output.code.contains(": Props"));
        assert!(!output.code.contains("<h1>"));
        assert!(output.code.contains("function Greeting"));
    }

    #[test]
    fn test_inline_source_map() {
        let spec = TranspileSpec::new("App.jsx").with_sourcemaps(SourceMapKind::Inline);
        let output = SwcBackend::new()
            .transpile(&spec, "const el = <p>hi</p>;")
            .unwrap();

        assert!(output.source_map.is_none());
        let marker = "//# sourceMappingURL=data:application/json;base64,";
        let idx = output.code.rfind(marker).expect("inline map comment");
        let encoded = output.code[idx + marker.len()..].trim();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let map: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(map["version"], 3);
        assert!(map["sources"].to_string().contains("App.jsx"));
    }

    #[test]
    fn test_external_source_map() {
        let spec = TranspileSpec::new("app.ts").with_sourcemaps(SourceMapKind::External);
        let output = SwcBackend::new()
            .transpile(&spec, "const x: number = 42;")
            .unwrap();
        let map = output.source_map.unwrap();
        assert!(map.contains("\"version\":3"));
        assert!(!output.code.contains("sourceMappingURL"));
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = SwcBackend::new()
            .transpile(&TranspileSpec::new("app.js"), "const x = {")
            .unwrap_err();
        assert_eq!(err.code, "COMPILER_PARSE_ERROR");
        assert_eq!(err.diagnostics.len(), 1);
        assert_eq!(err.diagnostics[0].line, Some(1));
    }

    #[test]
    fn test_unsupported_extension() {
        let err = SwcBackend::new()
            .transpile(&TranspileSpec::new("style.css"), "body {}")
            .unwrap_err();
        assert_eq!(err.code, "COMPILER_UNSUPPORTED_FILE");
    }
}
