use modhost_core::{
    DescriptorStore, DispatchError, ExtensionHost, HostCollaborators, HookTable,
    InfoDescriptorParser, MemoryDescriptorSource, MemoryErrorSink, MemoryExtensionStore,
    NoopSchemaMigrator, Placement,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn host(descriptors: &[(&str, &str)], table: HookTable) -> (ExtensionHost, Arc<MemoryErrorSink>) {
    let mut source = MemoryDescriptorSource::new();
    for (id, text) in descriptors {
        source.insert(*id, *text);
    }
    let errors = Arc::new(MemoryErrorSink::new());
    let host = ExtensionHost::new(
        DescriptorStore::new(source, InfoDescriptorParser),
        HostCollaborators {
            store: Arc::new(MemoryExtensionStore::new()),
            probe: Arc::new(table),
            migrator: Arc::new(NoopSchemaMigrator),
            errors: errors.clone(),
        },
    );
    host.rebuild().expect("rebuild should succeed");
    (host, errors)
}

fn ids(implementers: Arc<[String]>) -> Vec<String> {
    implementers.to_vec()
}

fn record_alter(table: &mut HookTable, log: &Log, extension: &str, hook: &str) {
    let log = Arc::clone(log);
    let entry = format!("{extension}:{hook}");
    table.register_alter(extension, hook, move |_, _| {
        log.lock().expect("log lock").push(entry.clone());
        Ok(())
    });
}

const WEIGHTED: &[(&str, &str)] = &[
    ("m1", "name = M1\nweight = 0\n"),
    ("m2", "name = M2\nweight = 5\n"),
    ("m3", "name = M3\nweight = -5\n"),
];

#[test]
fn implementers_follow_enable_and_disable() {
    let mut table = HookTable::new();
    table
        .register("m1", "cron", |_| Ok(None))
        .register("m2", "cron", |_| Ok(None));
    let (host, _) = host(WEIGHTED, table);

    assert!(ids(host.implementers_of("cron").expect("implementers")).is_empty());

    host.enable(["m2", "m1"], true).expect("enable");
    assert_eq!(
        ids(host.implementers_of("cron").expect("implementers")),
        vec!["m1", "m2"]
    );

    host.disable(["m1"], false).expect("disable");
    assert_eq!(
        ids(host.implementers_of("cron").expect("implementers")),
        vec!["m2"]
    );
}

#[test]
fn alter_applies_mutations_in_weight_order() {
    let mut table = HookTable::new();
    table.register_alter("m1", "data_alter", |value, _| {
        value["a"] = json!(1);
        Ok(())
    });
    table.register_alter("m2", "data_alter", |value, _| {
        assert_eq!(value["a"], json!(1), "m1 must run before m2");
        value["b"] = json!(2);
        Ok(())
    });
    let (host, _) = host(WEIGHTED, table);
    host.enable(["m1", "m2"], true).expect("enable");

    let mut value = json!({});
    host.alter("data", &mut value, None, &Value::Null)
        .expect("alter should succeed");
    assert_eq!(value, json!({"a": 1, "b": 2}));
}

#[test]
fn targeted_alter_runs_right_after_generic_alter_of_same_extension() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut table = HookTable::new();
    record_alter(&mut table, &log, "m1", "form_alter");
    record_alter(&mut table, &log, "m1", "form_login_alter");
    record_alter(&mut table, &log, "m2", "form_alter");
    record_alter(&mut table, &log, "m2", "form_search_alter");
    let (host, _) = host(WEIGHTED, table);
    host.enable(["m1", "m2"], true).expect("enable");

    let mut value = json!({});
    host.alter("form", &mut value, Some("login"), &json!({"user": 1}))
        .expect("alter should succeed");

    assert_eq!(
        log.lock().expect("log lock").clone(),
        vec!["m1:form_alter", "m1:form_login_alter", "m2:form_alter"]
    );
}

#[test]
fn multi_type_alter_gives_each_extension_one_turn_in_weight_order() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut table = HookTable::new();
    record_alter(&mut table, &log, "m2", "form_alter");
    record_alter(&mut table, &log, "m1", "block_alter");
    record_alter(&mut table, &log, "m2", "block_alter");
    record_alter(&mut table, &log, "m3", "block_alter");
    let (host, _) = host(WEIGHTED, table);
    host.enable(["m1", "m2", "m3"], true).expect("enable");

    let mut value = json!({});
    host.alter(["form", "block"], &mut value, None, &Value::Null)
        .expect("alter should succeed");

    assert_eq!(
        log.lock().expect("log lock").clone(),
        vec![
            "m3:block_alter",
            "m1:block_alter",
            "m2:form_alter",
            "m2:block_alter"
        ]
    );
}

#[test]
fn alter_context_carries_hook_target_and_data() {
    let seen: Log = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&seen);
    let mut table = HookTable::new();
    table.register_alter("m1", "form_login_alter", move |_, context| {
        captured.lock().expect("log lock").push(format!(
            "{}|{}|{}",
            context.hook,
            context.target.unwrap_or("-"),
            context.data
        ));
        Ok(())
    });
    let (host, _) = host(WEIGHTED, table);
    host.enable(["m1"], true).expect("enable");

    let mut value = json!({});
    host.alter("form", &mut value, Some("login"), &json!({"uid": 7}))
        .expect("alter should succeed");
    assert_eq!(
        seen.lock().expect("log lock").clone(),
        vec![r#"form_login_alter|login|{"uid":7}"#]
    );
}

#[test]
fn failing_alter_keeps_prior_mutations_and_skips_the_rest() {
    let mut table = HookTable::new();
    table.register_alter("m3", "data_alter", |value, _| {
        value["first"] = json!(true);
        Ok(())
    });
    table.register_alter("m1", "data_alter", |_, _| Err("refused".to_string()));
    table.register_alter("m2", "data_alter", |value, _| {
        value["last"] = json!(true);
        Ok(())
    });
    let (host, errors) = host(WEIGHTED, table);
    host.enable(["m1", "m2", "m3"], true).expect("enable");

    let mut value = json!({});
    let err = host
        .alter("data", &mut value, None, &Value::Null)
        .expect_err("m1 fails");

    assert!(matches!(err, DispatchError::Implementer(ref hook) if hook.extension() == "m1"));
    assert_eq!(value, json!({"first": true}));
    assert_eq!(errors.take().len(), 1);
}

#[test]
fn collect_dispatch_reports_failures_and_continues() {
    let mut table = HookTable::new();
    table
        .register("m1", "permission", |_| Ok(Some(json!("administer m1"))))
        .register("m2", "permission", |_| Err("broken".to_string()))
        .register("m3", "permission", |_| Ok(None));
    let (host, errors) = host(WEIGHTED, table);
    host.enable(["m1", "m2", "m3"], true).expect("enable");

    let results = host
        .dispatch("permission", &Value::Null)
        .expect("dispatch should succeed");

    assert_eq!(results, vec![("m1".to_string(), json!("administer m1"))]);
    let reported = errors.take();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].extension(), "m2");
}

#[test]
fn merged_dispatch_combines_object_results() {
    let mut table = HookTable::new();
    table
        .register("m3", "menu", |_| Ok(Some(json!({"admin": {"title": "Admin"}, "paths": ["a"]}))))
        .register("m1", "menu", |_| Ok(Some(json!({"admin": {"weight": 1}, "paths": ["b"]}))))
        .register("m2", "menu", |_| Ok(Some(json!("not an object"))));
    let (host, _) = host(WEIGHTED, table);
    host.enable(["m1", "m2", "m3"], true).expect("enable");

    let merged = host
        .invoke_all_merged("menu", &Value::Null)
        .expect("merge should succeed");
    assert_eq!(
        merged,
        json!({"admin": {"title": "Admin", "weight": 1}, "paths": ["a", "b"]})
    );
}

#[test]
fn single_invoke_requires_enabled_implementer() {
    let mut table = HookTable::new();
    table.register("m1", "help", |args| Ok(Some(json!({"topic": args["topic"]}))));
    let (host, _) = host(WEIGHTED, table);

    let args = json!({"topic": "install"});
    assert_eq!(host.invoke("m1", "help", &args).expect("invoke"), None);

    host.enable(["m1"], true).expect("enable");
    assert_eq!(
        host.invoke("m1", "help", &args).expect("invoke"),
        Some(json!({"topic": "install"}))
    );
    assert_eq!(host.invoke("m1", "missing", &args).expect("invoke"), None);
}

#[test]
fn placement_overrides_reorder_one_hook() {
    let mut table = HookTable::new();
    for id in ["m1", "m2", "m3"] {
        table.register(id, "init", |_| Ok(None));
        table.register(id, "cron", |_| Ok(None));
    }
    let (host, _) = host(WEIGHTED, table);
    host.enable(["m1", "m2", "m3"], true).expect("enable");
    assert_eq!(
        ids(host.implementers_of("init").expect("implementers")),
        vec!["m3", "m1", "m2"]
    );

    host.set_placement("init", "m2", Placement::First);
    host.set_placement("init", "m3", Placement::Last);

    assert_eq!(
        ids(host.implementers_of("init").expect("implementers")),
        vec!["m2", "m1", "m3"]
    );
    assert_eq!(
        ids(host.implementers_of("cron").expect("implementers")),
        vec!["m3", "m1", "m2"]
    );
}

#[test]
fn weight_change_invalidates_cached_order() {
    let mut table = HookTable::new();
    for id in ["m1", "m2"] {
        table.register(id, "cron", |_| Ok(None));
    }
    let (host, _) = host(WEIGHTED, table);
    host.enable(["m1", "m2"], true).expect("enable");
    assert_eq!(
        ids(host.implementers_of("cron").expect("implementers")),
        vec!["m1", "m2"]
    );

    host.registry().set_weight("m1", 10).expect("set weight");
    assert_eq!(
        ids(host.implementers_of("cron").expect("implementers")),
        vec!["m2", "m1"]
    );
}

#[test]
fn collect_dispatch_skips_alter_implementations_without_reporting() {
    let mut table = HookTable::new();
    table
        .register_alter("m1", "form_alter", |_, _| Ok(()))
        .register("m2", "form_alter", |_| Ok(Some(json!("plain"))));
    let (host, errors) = host(WEIGHTED, table);
    host.enable(["m1", "m2"], true).expect("enable");

    assert_eq!(
        ids(host.implementers_of("form_alter").expect("implementers")),
        vec!["m1", "m2"]
    );
    let results = host
        .dispatch("form_alter", &Value::Null)
        .expect("dispatch should succeed");

    assert_eq!(results, vec![("m2".to_string(), json!("plain"))]);
    assert_eq!(host.invoke("m1", "form_alter", &Value::Null).expect("invoke"), None);
    assert!(errors.take().is_empty());
}
