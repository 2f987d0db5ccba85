//! Module loader for the runtime thread.
//!
//! Resolves relative and absolute imports against the referrer and bare
//! specifiers against the configured library directory. JSON files load as
//! JSON modules; CommonJS-shaped sources are wrapped so `module.exports`
//! keeps working under the ES module pipeline.

use anyhow::anyhow;
use deno_core::error::AnyError;
use deno_core::{
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier, ModuleType,
    RequestedModuleType, ResolutionKind,
};
use std::path::{Path, PathBuf};

pub struct BridgeModuleLoader {
    /// Root for bare specifiers (the runtime library).
    library_dir: PathBuf,
}

impl BridgeModuleLoader {
    pub fn new(library_dir: PathBuf) -> Self {
        Self { library_dir }
    }

    fn resolve_module_path(&self, specifier: &str, referrer: &Path) -> anyhow::Result<PathBuf> {
        if let Some(path) = specifier.strip_prefix("file://") {
            return self.resolve_with_extensions(PathBuf::from(path));
        }

        if specifier.starts_with("./") || specifier.starts_with("../") {
            let referrer_dir = referrer.parent().unwrap_or(&self.library_dir);
            return self.resolve_with_extensions(referrer_dir.join(specifier));
        }

        if specifier.starts_with('/') {
            return self.resolve_with_extensions(PathBuf::from(specifier));
        }

        // Bare specifier: resolved inside the library directory only.
        self.resolve_with_extensions(self.library_dir.join(specifier))
    }

    /// Try the path as-is, then with common extensions, then as a directory
    /// with an index file.
    fn resolve_with_extensions(&self, base: PathBuf) -> anyhow::Result<PathBuf> {
        if base.is_file() {
            return Ok(base);
        }

        let extensions = [".js", ".mjs", ".cjs", ".json"];
        for ext in extensions {
            let with_ext = PathBuf::from(format!("{}{}", base.to_string_lossy(), ext));
            if with_ext.is_file() {
                return Ok(with_ext);
            }
        }

        if base.is_dir() {
            for ext in extensions {
                let index = base.join(format!("index{ext}"));
                if index.is_file() {
                    return Ok(index);
                }
            }
        }

        Err(anyhow!("cannot resolve module: {:?}", base))
    }

    fn detect_module_type(&self, path: &Path) -> ModuleType {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => ModuleType::Json,
            _ => ModuleType::JavaScript,
        }
    }
}

impl ModuleLoader for BridgeModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, AnyError> {
        let referrer_path = PathBuf::from(referrer.strip_prefix("file://").unwrap_or(referrer));

        let resolved = self.resolve_module_path(specifier, &referrer_path)?;
        let canonical = std::fs::canonicalize(&resolved).unwrap_or(resolved);

        ModuleSpecifier::from_file_path(&canonical)
            .map_err(|_| anyhow!("failed to create module specifier for {:?}", canonical).into())
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let path = match module_specifier.to_file_path() {
            Ok(p) => p,
            Err(_) => return ModuleLoadResponse::Sync(Err(anyhow!("invalid file path").into())),
        };

        let code = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                return ModuleLoadResponse::Sync(Err(
                    anyhow!("failed to read module {:?}: {e}", path).into()
                ))
            }
        };

        let module_type = self.detect_module_type(&path);

        let code = if module_type == ModuleType::JavaScript && is_commonjs(&code) {
            wrap_commonjs(&code)
        } else {
            code
        };

        ModuleLoadResponse::Sync(Ok(ModuleSource::new(
            module_type,
            ModuleSourceCode::String(code.into()),
            module_specifier,
            None,
        )))
    }
}

/// Quick heuristics for CommonJS-shaped source.
fn is_commonjs(code: &str) -> bool {
    code.contains("module.exports")
        || code.contains("exports.")
        || (code.contains("require(") && !code.contains("import "))
}

/// Wrap CommonJS code as an ES module exporting `module.exports`.
fn wrap_commonjs(code: &str) -> String {
    format!(
        r#"
const module = {{ exports: {{}} }};
const exports = module.exports;
function require(specifier) {{
    throw new Error('require() is not supported. Use ESM imports instead.');
}}

{}

export default module.exports;
const __exports = module.exports;
export {{ __exports as exports }};
"#,
        code
    )
}
