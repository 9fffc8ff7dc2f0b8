//! Built-in extensions
//!
//! | name       | kind   | phases                 | metadata key          |
//! |------------|--------|------------------------|-----------------------|
//! | `req`      | tag    | compile-time, runtime  | `builder.requests`    |
//! | `error`    | tag    | compile-time, runtime  | `error.codes`         |
//! | `upper`    | filter | compile-time, runtime  |                       |
//! | `lower`    | filter | compile-time, runtime  |                       |
//! | `required` | filter | compile-time, runtime  | `parameters.required` |

mod error;
mod filters;
mod request;

use crate::error::ConfigurationError;
use crate::extension::{Extension, ExtensionDecl};

pub use error::{ErrorTagBuilder, ErrorTagRunner};
pub use filters::{CaseFilter, RequiredFilterBuilder, RequiredFilterRunner, SyncFilter};
pub use request::{RequestTagBuilder, RequestTagRunner};

/// Every built-in extension, in registration order
pub fn catalog() -> Vec<Extension> {
    vec![
        Extension::tag_builder(RequestTagBuilder),
        Extension::tag_runner(RequestTagRunner),
        Extension::tag_builder(ErrorTagBuilder),
        Extension::tag_runner(ErrorTagRunner),
        Extension::filter_builder(SyncFilter("upper")),
        Extension::filter_runner(CaseFilter::upper()),
        Extension::filter_builder(SyncFilter("lower")),
        Extension::filter_runner(CaseFilter::lower()),
        Extension::filter_builder(RequiredFilterBuilder),
        Extension::filter_runner(RequiredFilterRunner),
    ]
}

/// Pick the built-ins named by `decls`, keeping the declaration order
pub fn select(decls: &[ExtensionDecl]) -> Result<Vec<Extension>, ConfigurationError> {
    let catalog = catalog();
    decls
        .iter()
        .map(|decl| {
            let (phase, kind) = decl.resolve()?;
            catalog
                .iter()
                .find(|ext| ext.matches(phase, kind, &decl.name))
                .cloned()
                .ok_or_else(|| ConfigurationError::UnknownExtension {
                    phase,
                    kind,
                    name: decl.name.clone(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{load_extensions, ExtensionKind, Phase};

    #[test]
    fn test_catalog_loads_cleanly() {
        let envs = load_extensions(catalog()).unwrap();
        assert!(envs.compile_time.has_tag("req"));
        assert!(envs.runtime.has_tag("error"));
        assert!(envs.runtime.has_filter("required"));
        assert!(envs.compile_time.async_filters().is_empty());
        let providers: Vec<_> = envs.metadata_providers().map(|e| e.name()).collect();
        assert_eq!(providers, vec!["req", "error", "required"]);
    }

    #[test]
    fn test_select_keeps_declaration_order() {
        let selected = select(&[
            ExtensionDecl::new("runtime", "filter", "upper"),
            ExtensionDecl::new("compile-time", "filter", "upper"),
        ])
        .unwrap();
        assert_eq!(selected[0].phase(), Phase::Runtime);
        assert_eq!(selected[1].phase(), Phase::CompileTime);
    }

    #[test]
    fn test_select_unknown_builtin() {
        let err = select(&[ExtensionDecl::new("runtime", "tag", "paginate")]).unwrap_err();
        match err {
            ConfigurationError::UnknownExtension { phase, kind, name } => {
                assert_eq!(phase, Phase::Runtime);
                assert_eq!(kind, ExtensionKind::Tag);
                assert_eq!(name, "paginate");
            }
            other => panic!("Expected unknown extension, got {:?}", other),
        }
    }

    #[test]
    fn test_select_invalid_phase() {
        let err = select(&[ExtensionDecl::new("build-time", "tag", "req")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidPhase(_)));
    }
}
