use std::sync::Arc;

use jinx::get_rendered;
use jinx::materialization_name;
use jinx::return_function;
use jinx::ErrorKind;
use jinx::MacroGenerator;
use jinx::MacroNode;
use jinx::MacroStack;
use jinx::Node;
use jinx::ParsedNode;
use jinx::SharedContext;
use jinx::TemplateCache;
use jinx_templates::CallArgs;
use jinx_templates::Value;

/// A compilation session: one context, one stack and one cache, with the
/// given macro files registered as generators.
struct Session {
    context: SharedContext,
    stack: Arc<MacroStack>,
    cache: Arc<TemplateCache>,
    model: Arc<ParsedNode>,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Session {
    fn new() -> Self {
        init_logging();
        let context = SharedContext::default();
        context.insert("return", return_function());
        Self {
            context,
            stack: Arc::new(MacroStack::new()),
            cache: Arc::new(TemplateCache::new()),
            model: Arc::new(ParsedNode::new("model", "pkg", "orders", "models/orders.sql", "")),
        }
    }

    fn model(&self) -> Arc<dyn Node> {
        self.model.clone()
    }

    fn generator(&self, node: MacroNode) -> MacroGenerator {
        MacroGenerator::new(Arc::new(node))
            .with_context(&self.context)
            .with_node(self.model())
            .with_stack(Arc::clone(&self.stack))
            .with_cache(Arc::clone(&self.cache))
    }

    fn define(&self, name: &str, sql: &str) {
        let node = MacroNode::new("pkg", name, format!("macros/{name}.sql"), sql);
        self.context.insert(name, Value::from_object(self.generator(node)));
    }

    fn render(&self, source: &str, capture_undefined: bool) -> Result<Value, jinx::Error> {
        let model = self.model();
        get_rendered(source, self.context.snapshot(), Some(&model), capture_undefined, false)
    }
}

mod invocation {
    use super::*;

    #[test]
    fn test_macro_calling_macro() {
        let session = Session::new();
        session.define("quote", "{% macro quote(x) %}\"{{ x }}\"{% endmacro %}");
        session.define(
            "columns",
            "{% macro columns(cols) %}{% for c in cols %}{{ quote(c) }}{% if not loop.last %}, {% endif %}{% endfor %}{% endmacro %}",
        );
        let rendered = session.render("select {{ columns(['a', 'b']) }}", false).unwrap();
        assert_eq!(rendered, Value::from("select \"a\", \"b\""));
    }

    #[test]
    fn test_early_return_in_native_render() {
        let session = Session::new();
        session.define("numbers", "{% macro numbers() %}{{ return([1, 2, 3]) }}{% endmacro %}");
        let model = session.model();
        let rendered =
            get_rendered("{{ numbers() }}", session.context.snapshot(), Some(&model), false, true).unwrap();
        assert_eq!(rendered, Value::from(vec![1, 2, 3]));
    }

    #[test]
    fn test_materializations_resolve_per_adapter() {
        let session = Session::new();
        let sql = "{% materialization table, default %}generic{% endmaterialization %}\
                   {% materialization table, adapter='postgres' %}postgres{% endmaterialization %}";
        for (adapter, expected) in [(None, "generic"), (Some("postgres"), "postgres")] {
            let node = MacroNode::new(
                "pkg",
                materialization_name("table", adapter),
                "macros/materializations/table.sql",
                sql,
            );
            let generator = session.generator(node);
            assert_eq!(generator.call_macro(CallArgs::default()).unwrap(), Value::from(expected));
        }
        assert_eq!(session.cache.len(), 1);
    }

    #[test]
    fn test_unknown_materialization_argument() {
        let session = Session::new();
        let node = MacroNode::new(
            "pkg",
            materialization_name("table", None),
            "macros/table.sql",
            "{% materialization table, bogus=1 %}{% endmaterialization %}",
        );
        let err = session.generator(node).call_macro(CallArgs::default()).unwrap_err();
        let err = err.as_compilation().unwrap();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(err.message().contains("bogus"));
    }
}

mod undefined {
    use super::*;

    #[test]
    fn test_passing_undefined_through_succeeds() {
        let session = Session::new();
        session.define("passthrough", "{% macro passthrough(x) %}ok{% endmacro %}");
        let rendered = session.render("{{ passthrough(missing.attr) }}", true).unwrap();
        assert_eq!(rendered, Value::from("ok"));
    }

    #[test]
    fn test_rendering_undefined_fails() {
        let session = Session::new();
        session.define("show", "{% macro show(x) %}{{ x }}{% endmacro %}");
        let err = session.render("{{ show(missing) }}", true).unwrap_err();
        let err = err.as_compilation().unwrap();
        assert_eq!(err.kind(), ErrorKind::UndefinedReference);
        assert!(err.message().contains("missing"));
        assert_eq!(err.node().unwrap().name, "orders");
    }
}

mod call_stack {
    use super::*;

    #[test]
    fn test_only_outermost_call_registers_dependency() {
        let session = Session::new();
        session.define("inner", "{% macro inner() %}i{% endmacro %}");
        session.define("outer", "{% macro outer() %}o{{ inner() }}{% endmacro %}");
        session.render("{{ outer() }}{{ outer() }}", false).unwrap();
        assert_eq!(session.model.macro_dependencies(), vec!["macro.pkg.outer"]);
        assert_eq!(session.stack.depth(), 0);
    }

    #[test]
    fn test_recursive_chain_registers_once() {
        let session = Session::new();
        session.define(
            "countdown",
            "{% macro countdown(n) %}{{ n }}{% if n > 0 %}{{ countdown(n - 1) }}{% endif %}{% endmacro %}",
        );
        let rendered = session.render("{{ countdown(3) }}", false).unwrap();
        assert_eq!(rendered, Value::from("3210"));
        assert_eq!(session.model.macro_dependencies(), vec!["macro.pkg.countdown"]);
    }

    #[test]
    fn test_stack_balanced_after_failure() {
        let session = Session::new();
        session.define("broken", "{% macro broken() %}{{ 1 + 'a' }}{% endmacro %}");
        session.define("caller_of_broken", "{% macro caller_of_broken() %}{{ broken() }}{% endmacro %}");
        assert!(session.render("{{ caller_of_broken() }}", false).is_err());
        assert_eq!(session.stack.depth(), 0);
        assert_eq!(session.model.macro_dependencies(), vec!["macro.pkg.caller_of_broken"]);
    }

    #[test]
    fn test_error_carries_call_chain() {
        let session = Session::new();
        session.define("inner", "{% macro inner() %}{{ 1 + 'a' }}{% endmacro %}");
        session.define("outer", "{% macro outer() %}{{ inner() }}{% endmacro %}");
        let err = session.render("{{ outer() }}", false).unwrap_err();
        let err = err.as_compilation().unwrap();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(err.node().unwrap().name, "orders");
        let chain: Vec<_> = err.stack().iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(chain, vec!["inner", "outer"]);

        let message = err.to_string();
        assert!(message.starts_with("Compilation Error in model orders (models/orders.sql)"));
        assert!(message.contains("> in macro inner (macros/inner.sql)"));
        assert!(message.contains("> called by macro outer (macros/outer.sql)"));
    }

    #[test]
    fn test_untracked_generator_registers_nothing() {
        let session = Session::new();
        let node = Arc::new(MacroNode::new("pkg", "m", "macros/m.sql", "{% macro m() %}m{% endmacro %}"));
        let generator = MacroGenerator::new(node)
            .with_context(&session.context)
            .with_cache(Arc::clone(&session.cache));
        assert_eq!(generator.call_macro(CallArgs::default()).unwrap(), Value::from("m"));
        assert!(session.model.macro_dependencies().is_empty());
    }
}

mod concurrency {
    use super::*;

    #[test]
    fn test_worker_threads_keep_separate_stacks() {
        let cache = Arc::new(TemplateCache::new());
        let sql = "{% macro nest(n) %}{% if n > 0 %}{{ nest(n - 1) }}{% endif %}{{ n }}{% endmacro %}";

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    let mut session = Session::new();
                    session.cache = cache;
                    session.model = Arc::new(ParsedNode::new(
                        "model",
                        "pkg",
                        format!("model_{worker}"),
                        format!("models/model_{worker}.sql"),
                        "",
                    ));
                    let node = MacroNode::new("pkg", "nest", "macros/nest.sql", sql);
                    session.context.insert("nest", Value::from_object(session.generator(node)));

                    for _ in 0..10 {
                        let rendered = session.render("{{ nest(5) }}", false).unwrap();
                        assert_eq!(rendered, Value::from("012345"));
                        assert_eq!(session.stack.depth(), 0);
                    }
                    assert_eq!(session.model.macro_dependencies(), vec!["macro.pkg.nest"]);
                });
            }
        });
        assert_eq!(cache.len(), 1);
    }
}
