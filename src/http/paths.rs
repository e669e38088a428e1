//! Go module proxy request paths.
//!
//! ```text
//! /{module}/@v/list
//! /{module}/@v/{version}.info
//! /{module}/@v/{version}.mod
//! /{module}/@v/{version}.zip
//! /{module}/@latest
//! /admin/upload/{module}/{version}
//! ```
//!
//! Module paths and versions arrive case-escaped (`!a` for `A`).

use crate::module::{unescape_path, ModuleVersion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModRequest {
    List { module: String },
    Info(ModuleVersion),
    Mod(ModuleVersion),
    Zip(ModuleVersion),
    Latest { module: String },
}

/// Parse a request path.  Returns `None` for anything that is not a module
/// proxy endpoint or carries a malformed escape.
pub fn parse_request(path: &str) -> Option<ModRequest> {
    let path = path.strip_prefix('/')?;

    if let Some(module) = path.strip_suffix("/@latest") {
        return Some(ModRequest::Latest {
            module: parse_module(module)?,
        });
    }

    let (module, rest) = path.split_once("/@v/")?;
    let module = parse_module(module)?;
    if rest == "list" {
        return Some(ModRequest::List { module });
    }

    let (version, ext) = rest.rsplit_once('.')?;
    if version.is_empty() || version.contains('/') {
        return None;
    }
    let mv = ModuleVersion::new(module, unescape_path(version)?);
    match ext {
        "info" => Some(ModRequest::Info(mv)),
        "mod" => Some(ModRequest::Mod(mv)),
        "zip" => Some(ModRequest::Zip(mv)),
        _ => None,
    }
}

/// Parse the `{module}/{version}` tail of an upload path.
pub fn parse_upload(target: &str) -> Option<ModuleVersion> {
    let (module, version) = target.trim_start_matches('/').rsplit_once('/')?;
    if version.is_empty() || version.starts_with('@') {
        return None;
    }
    Some(ModuleVersion::new(
        parse_module(module)?,
        unescape_path(version)?,
    ))
}

fn parse_module(escaped: &str) -> Option<String> {
    if escaped.is_empty() || escaped.contains("/@") {
        return None;
    }
    unescape_path(escaped)
}
