//! In-process store of compiled template listings.
//!
//! With macro debugging on, every template compiled under the default name
//! gets its listing registered here under a fresh name, and optionally written
//! to disk, so errors point at something a debugger can open.

use std::io::Write;
use std::sync::Arc;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use dashmap::DashMap;
use jinx_conf::MacroDebugging;
use jinx_templates::CompileHook;
use jinx_templates::DEFAULT_TEMPLATE_NAME;
use tempfile::Builder;
use uuid::Uuid;

use crate::flags;

const DUMP_PREFIX: &str = "jinx-macro-compiled-";

/// Dump files hold the pretty-printed syntax tree of the compiled template body.
const DUMP_SUFFIX: &str = ".jinxc";

static SOURCES: LazyLock<DashMap<String, Arc<[String]>>> = LazyLock::new(DashMap::new);

/// The stored lines for `name`, each terminated by a newline.
#[must_use]
pub fn lookup(name: &str) -> Option<Arc<[String]>> {
    SOURCES.get(name).map(|entry| Arc::clone(entry.value()))
}

/// Store `listing` and return the name it was stored under.
#[must_use]
pub fn inject(listing: &str, write: bool) -> String {
    let name = if write {
        write_dump(listing).unwrap_or_else(|err| {
            tracing::warn!("failed to write compiled template listing: {}", err);
            ephemeral_name()
        })
    } else {
        ephemeral_name()
    };

    let lines: Arc<[String]> = listing.lines().map(|line| format!("{line}\n")).collect();
    SOURCES.insert(name.clone(), lines);
    tracing::debug!("stored compiled listing as {}", name);
    name
}

fn ephemeral_name() -> String {
    Uuid::new_v4().simple().to_string()
}

fn write_dump(listing: &str) -> std::io::Result<String> {
    let mut file = Builder::new()
        .prefix(DUMP_PREFIX)
        .suffix(DUMP_SUFFIX)
        .tempfile()?;
    file.write_all(listing.as_bytes())?;
    let (_, path) = file.keep().map_err(|err| err.error)?;
    let path = Utf8PathBuf::from_path_buf(path).map_err(|path| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("non UTF-8 temp path {}", path.display()),
        )
    })?;
    Ok(path.into_string())
}

/// Compile hook that redirects default-named templates into the store while
/// macro debugging is on.
#[derive(Debug, Default)]
pub struct DebugSourceHook;

impl CompileHook for DebugSourceHook {
    fn on_compile(&self, listing: &str, filename: &str) -> Option<String> {
        if filename != DEFAULT_TEMPLATE_NAME {
            return None;
        }
        match flags::macro_debugging() {
            MacroDebugging::Off => None,
            MacroDebugging::Inject => Some(inject(listing, false)),
            MacroDebugging::Write => Some(inject(listing, true)),
        }
    }
}
