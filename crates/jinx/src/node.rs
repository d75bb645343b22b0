use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;

use camino::Utf8Path;
use camino::Utf8PathBuf;
use indexmap::IndexSet;
use serde::Deserialize;
use serde::Serialize;

/// A resource the compiler is working on: a model, a test, a macro file.
///
/// Nodes are shared between worker threads, so dependency registration goes
/// through `&self`.
pub trait Node: Send + Sync {
    fn unique_id(&self) -> &str;

    fn name(&self) -> &str;

    fn resource_type(&self) -> &str;

    fn package_name(&self) -> &str;

    fn original_file_path(&self) -> &Utf8Path;

    fn raw_source(&self) -> &str;

    /// Record that this node calls the macro `unique_id`. Must be idempotent.
    fn add_macro_dependency(&self, unique_id: &str);

    /// Keyword arguments of a schema test, if this node is one.
    fn test_metadata(&self) -> Option<&TestMetadata> {
        None
    }

    fn attribution(&self) -> Attribution {
        Attribution {
            resource_type: self.resource_type().to_string(),
            name: self.name().to_string(),
            original_file_path: self.original_file_path().to_owned(),
        }
    }
}

/// The part of a node that error messages name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribution {
    pub resource_type: String,
    pub name: String,
    pub original_file_path: Utf8PathBuf,
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.resource_type, self.name, self.original_file_path
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TestMetadata {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default)]
struct DependsOn {
    macros: Mutex<IndexSet<String>>,
}

impl DependsOn {
    fn add(&self, unique_id: &str) {
        let mut macros = self.macros.lock().unwrap_or_else(PoisonError::into_inner);
        if macros.insert(unique_id.to_string()) {
            tracing::debug!("registered macro dependency {}", unique_id);
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.macros
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// A macro file entry: one named macro and the source of the file defining it.
#[derive(Debug)]
pub struct MacroNode {
    unique_id: String,
    name: String,
    package_name: String,
    original_file_path: Utf8PathBuf,
    macro_sql: String,
    depends_on: DependsOn,
}

impl MacroNode {
    /// `name` is the user-visible name (`materialization:table:default` for
    /// materializations); the unique id is `macro.<package>.<name>`.
    pub fn new(
        package_name: impl Into<String>,
        name: impl Into<String>,
        original_file_path: impl Into<Utf8PathBuf>,
        macro_sql: impl Into<String>,
    ) -> Self {
        let package_name = package_name.into();
        let name = name.into();
        Self {
            unique_id: format!("macro.{package_name}.{name}"),
            name,
            package_name,
            original_file_path: original_file_path.into(),
            macro_sql: macro_sql.into(),
            depends_on: DependsOn::default(),
        }
    }

    #[must_use]
    pub fn macro_dependencies(&self) -> Vec<String> {
        self.depends_on.snapshot()
    }
}

impl Node for MacroNode {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resource_type(&self) -> &str {
        "macro"
    }

    fn package_name(&self) -> &str {
        &self.package_name
    }

    fn original_file_path(&self) -> &Utf8Path {
        &self.original_file_path
    }

    fn raw_source(&self) -> &str {
        &self.macro_sql
    }

    fn add_macro_dependency(&self, unique_id: &str) {
        self.depends_on.add(unique_id);
    }
}

/// Any other compiled resource: models, snapshots, schema tests.
#[derive(Debug)]
pub struct ParsedNode {
    unique_id: String,
    name: String,
    resource_type: String,
    package_name: String,
    original_file_path: Utf8PathBuf,
    raw_sql: String,
    test_metadata: Option<TestMetadata>,
    depends_on: DependsOn,
}

impl ParsedNode {
    pub fn new(
        resource_type: impl Into<String>,
        package_name: impl Into<String>,
        name: impl Into<String>,
        original_file_path: impl Into<Utf8PathBuf>,
        raw_sql: impl Into<String>,
    ) -> Self {
        let resource_type = resource_type.into();
        let package_name = package_name.into();
        let name = name.into();
        Self {
            unique_id: format!("{resource_type}.{package_name}.{name}"),
            name,
            resource_type,
            package_name,
            original_file_path: original_file_path.into(),
            raw_sql: raw_sql.into(),
            test_metadata: None,
            depends_on: DependsOn::default(),
        }
    }

    #[must_use]
    pub fn with_test_metadata(mut self, metadata: TestMetadata) -> Self {
        self.test_metadata = Some(metadata);
        self
    }

    /// Macros this node depends on, in registration order.
    #[must_use]
    pub fn macro_dependencies(&self) -> Vec<String> {
        self.depends_on.snapshot()
    }
}

impl Node for ParsedNode {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn package_name(&self) -> &str {
        &self.package_name
    }

    fn original_file_path(&self) -> &Utf8Path {
        &self.original_file_path
    }

    fn raw_source(&self) -> &str {
        &self.raw_sql
    }

    fn add_macro_dependency(&self, unique_id: &str) {
        self.depends_on.add(unique_id);
    }

    fn test_metadata(&self) -> Option<&TestMetadata> {
        self.test_metadata.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids() {
        let node = MacroNode::new("pkg", "my_macro", "macros/m.sql", "");
        assert_eq!(node.unique_id(), "macro.pkg.my_macro");

        let model = ParsedNode::new("model", "pkg", "orders", "models/orders.sql", "select 1");
        assert_eq!(model.unique_id(), "model.pkg.orders");
        assert_eq!(
            model.attribution().to_string(),
            "model orders (models/orders.sql)"
        );
    }

    #[test]
    fn test_dependencies_are_idempotent() {
        let model = ParsedNode::new("model", "pkg", "orders", "models/orders.sql", "");
        model.add_macro_dependency("macro.pkg.a");
        model.add_macro_dependency("macro.pkg.b");
        model.add_macro_dependency("macro.pkg.a");
        assert_eq!(model.macro_dependencies(), vec!["macro.pkg.a", "macro.pkg.b"]);
    }
}
