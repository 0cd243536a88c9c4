use std::sync::{Arc, Weak};

use anyhow::Context;
use parking_lot::Mutex;
use serde_json::json;
use webview_bridge::bridge::{
    BridgeError, DescriptorBuilder, ErrorKind, ExposedObject, InitPolicy, ObjectId, ValueCell,
    ValueFlags, WebviewBridge,
};
use webview_bridge::surface::RecordingSurface;
use webview_bridge::BridgeConfig;

const BINDING: &str = "__bridgeInternal";

struct Test {
    count: ValueCell<i32>,
    serial: ValueCell<String>,
}

impl ExposedObject for Test {
    fn describe(desc: &mut DescriptorBuilder<Self>) {
        desc.value("count", |test| &test.count)
            .value_with("serial", |test| &test.serial, ValueFlags::default().read_only())
            .function("ringBell", |test, (): ()| {
                test.count.update(|count| *count += 1);
                Ok(())
            })
            .function("add", |test, (by, label): (i32, String)| {
                let count = test.count.update(|count| {
                    *count += by;
                    *count
                });
                Ok(format!("{label}: {}", count.unwrap_or_default()))
            })
            .function("save", |_, (): ()| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("disk full")).context("saving counter")
            })
            .function("explode", |_, (): ()| -> anyhow::Result<()> {
                panic!("wires crossed")
            });
    }
}

struct Child {
    label: ValueCell<String>,
}

impl ExposedObject for Child {
    fn describe(desc: &mut DescriptorBuilder<Self>) {
        desc.value("label", |child| &child.label);
    }
}

struct Parent {
    b: Mutex<Option<Arc<Child>>>,
}

impl ExposedObject for Parent {
    fn describe(desc: &mut DescriptorBuilder<Self>) {
        desc.child("b", |parent| parent.b.lock().clone());
    }
}

/// Reads another object's property through the bridge while handling a call.
struct Relay {
    bridge: Mutex<Weak<WebviewBridge>>,
}

impl ExposedObject for Relay {
    fn describe(desc: &mut DescriptorBuilder<Self>) {
        desc.function("read", |relay, (id, property): (String, String)| {
            let bridge = relay
                .bridge
                .lock()
                .upgrade()
                .context("bridge is gone")?;
            let raw = json!(["GET", {"id": id, "property": property}]).to_string();
            let value = bridge.dispatch(&raw)?;
            Ok(value.map(|encoded| serde_json::from_str::<serde_json::Value>(&encoded)).transpose()?)
        });
    }
}

fn child(label: &str) -> Arc<Child> {
    Arc::new(Child {
        label: ValueCell::new(label.to_string()),
    })
}

fn parent_with(label: &str) -> Arc<Parent> {
    Arc::new(Parent {
        b: Mutex::new(Some(child(label))),
    })
}

fn test_object() -> Arc<Test> {
    Arc::new(Test {
        count: ValueCell::new(0),
        serial: ValueCell::new("T-1".to_string()),
    })
}

fn setup(config: BridgeConfig) -> (Arc<RecordingSurface>, WebviewBridge) {
    let surface = Arc::new(RecordingSurface::new());
    let bridge = WebviewBridge::new(surface.clone(), &config).unwrap();
    (surface, bridge)
}

fn get(id: &ObjectId, property: &str) -> String {
    json!(["GET", {"id": id, "property": property}]).to_string()
}

fn set(id: &ObjectId, property: &str, value: serde_json::Value) -> String {
    json!(["SET", {"id": id, "property": property, "newValue": value}]).to_string()
}

fn invoke(id: &ObjectId, function: &str, arguments: serde_json::Value) -> String {
    json!(["INVOKE", {"id": id, "function": function, "arguments": arguments}]).to_string()
}

#[tokio::test]
async fn ring_bell_then_set_and_get_count() {
    let (surface, bridge) = setup(BridgeConfig::default());
    let id = bridge.define_object("Test", test_object()).unwrap();

    assert_eq!(surface.invoke(BINDING, &invoke(&id, "ringBell", json!([]))), Ok(None));
    assert_eq!(surface.invoke(BINDING, &get(&id, "count")), Ok(Some("1".into())));
    assert_eq!(surface.invoke(BINDING, &set(&id, "count", json!(10))), Ok(None));
    assert_eq!(surface.invoke(BINDING, &get(&id, "count")), Ok(Some("10".into())));
    assert_eq!(
        surface.invoke(BINDING, &invoke(&id, "add", json!([5, "total"]))),
        Ok(Some("\"total: 15\"".into()))
    );
}

#[tokio::test]
async fn define_object_declares_stubs_and_installs_init_script() {
    let (surface, bridge) = setup(BridgeConfig::default());
    assert!(surface.is_bound(BINDING));
    let attached = surface.take_evals();
    assert_eq!(attached.len(), 1);
    assert!(attached[0].contains(r#"const bindingName = "__bridgeInternal";"#));

    let id = bridge.define_object("Test", test_object()).unwrap();

    let evals = surface.evals();
    assert_eq!(
        evals[0],
        format!(r#"window.Bridge.__internal.defineObject("Test","{id}");"#)
    );
    assert!(evals.contains(&format!(
        r#"window.Test.__internal.defineFunction("ringBell","{id}");"#
    )));
    assert!(evals.contains(&r#"window.Test.__internal.defineProperty("count");"#.to_string()));

    let script = surface.init_script().unwrap();
    assert!(script.contains(r#"const bindingName = "__bridgeInternal";"#));
    assert!(script.contains(&evals[0]));
}

#[tokio::test]
async fn read_only_property_rejects_set_but_allows_get() {
    let (surface, bridge) = setup(BridgeConfig::default());
    let id = bridge.define_object("Test", test_object()).unwrap();

    let err = bridge.dispatch(&set(&id, "serial", json!("T-2"))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    let message = surface
        .invoke(BINDING, &set(&id, "serial", json!(null)))
        .unwrap_err();
    assert!(message.contains("not permitted"), "{message}");
    assert_eq!(bridge.dispatch(&get(&id, "serial")).unwrap(), Some("\"T-1\"".into()));
}

#[tokio::test]
async fn arity_is_checked_before_argument_types() {
    let (_surface, bridge) = setup(BridgeConfig::default());
    let id = bridge.define_object("Test", test_object()).unwrap();

    for arguments in [json!([1]), json!(["x", "y", "z"]), json!([{"a": 1}, null, 3])] {
        let err = bridge.dispatch(&invoke(&id, "add", arguments)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Arity);
    }
    let err = bridge.dispatch(&invoke(&id, "ringBell", json!([true]))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Arity);
    assert!(err.to_string().contains("argument count mismatch"));
}

#[tokio::test]
async fn bad_arguments_name_their_position() {
    let (_surface, bridge) = setup(BridgeConfig::default());
    let id = bridge.define_object("Test", test_object()).unwrap();

    let err = bridge
        .dispatch(&invoke(&id, "add", json!([1, {"not": "a label"}])))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Coercion);
    assert!(err.to_string().starts_with("argument 1"), "{err}");

    let err = bridge.dispatch(&set(&id, "count", json!("ten"))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Coercion);
}

#[tokio::test]
async fn null_set_clears_instead_of_coercing() {
    let (_surface, bridge) = setup(BridgeConfig::default());
    let test = test_object();
    let id = bridge.define_object("Test", Arc::clone(&test)).unwrap();

    assert_eq!(bridge.dispatch(&set(&id, "count", json!(null))).unwrap(), None);
    assert!(test.count.is_empty());
    assert_eq!(bridge.dispatch(&get(&id, "count")).unwrap(), None);
}

#[tokio::test]
async fn unknown_targets_are_resolution_errors() {
    let (_surface, bridge) = setup(BridgeConfig::default());
    let id = bridge.define_object("Test", test_object()).unwrap();

    let unknown = ObjectId::from("no-such-object");
    for raw in [
        get(&unknown, "count"),
        get(&id, "missing"),
        set(&id, "missing", json!(1)),
        invoke(&id, "missing", json!([])),
    ] {
        let err = bridge.dispatch(&raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution, "{raw}");
        assert!(!err.is_fatal());
    }
    assert!(!bridge.router().is_poisoned());
}

#[tokio::test]
async fn host_failures_are_rejected_with_their_chain() {
    let (surface, bridge) = setup(BridgeConfig::default());
    let id = bridge.define_object("Test", test_object()).unwrap();

    let message = surface.invoke(BINDING, &invoke(&id, "save", json!([]))).unwrap_err();
    assert!(message.starts_with("saving counter"), "{message}");
    assert!(message.contains("disk full"), "{message}");

    let err = bridge.dispatch(&invoke(&id, "explode", json!([]))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Host);
    assert_eq!(err.to_string(), "wires crossed");

    // The router keeps serving after a host panic.
    assert_eq!(bridge.dispatch(&get(&id, "count")).unwrap(), Some("0".into()));
}

#[tokio::test]
async fn nested_child_is_addressable_under_dotted_path() {
    let (_surface, bridge) = setup(BridgeConfig::default());
    let parent = Arc::new(Parent {
        b: Mutex::new(Some(Arc::new(Child {
            label: ValueCell::new("inner".into()),
        }))),
    });
    let parent_id = bridge.define_object("A", parent).unwrap();
    let child = bridge.registry().lookup_path("A.b").unwrap();
    assert_ne!(child.id(), &parent_id);
    assert_eq!(
        bridge.dispatch(&get(child.id(), "label")).unwrap(),
        Some("\"inner\"".into())
    );
}

#[tokio::test]
async fn replacing_a_path_retires_the_old_identifier() {
    let (_surface, bridge) = setup(BridgeConfig::default());
    let old = bridge.define_object("Test", test_object()).unwrap();
    let new = bridge.define_object("Test", test_object()).unwrap();
    assert_ne!(old, new);

    for raw in [
        get(&old, "count"),
        set(&old, "count", json!(1)),
        invoke(&old, "ringBell", json!([])),
    ] {
        assert_eq!(bridge.dispatch(&raw).unwrap_err().kind(), ErrorKind::Resolution);
    }
    assert_eq!(bridge.dispatch(&get(&new, "count")).unwrap(), Some("0".into()));
}

#[tokio::test]
async fn protocol_error_poisons_channel_until_init() {
    let (surface, bridge) = setup(BridgeConfig::default());
    let id = bridge.define_object("Test", test_object()).unwrap();

    let err = bridge.dispatch(r#"["DELETE",{"id":"x"}]"#).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(bridge.router().is_poisoned());

    let err = bridge.dispatch(&get(&id, "count")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    assert_eq!(surface.invoke(BINDING, r#"["INIT",{}]"#), Ok(None));
    assert!(!bridge.router().is_poisoned());
    assert_eq!(bridge.dispatch(&get(&id, "count")).unwrap(), Some("0".into()));
}

#[tokio::test]
async fn init_with_root_policy_rewalks_and_reports_completion() {
    let (surface, bridge) = setup(BridgeConfig::default());
    assert_eq!(bridge.init_policy(), InitPolicy::Roots);
    let parent = Arc::new(Parent {
        b: Mutex::new(Some(Arc::new(Child {
            label: ValueCell::new("first".into()),
        }))),
    });
    bridge.define_object("A", Arc::clone(&parent)).unwrap();
    let old_child = bridge.registry().lookup_path("A.b").unwrap().id().clone();

    *parent.b.lock() = Some(Arc::new(Child {
        label: ValueCell::new("second".into()),
    }));
    surface.take_evals();
    bridge.dispatch(r#"["INIT",{}]"#).unwrap();

    let new_child = bridge.registry().lookup_path("A.b").unwrap().id().clone();
    assert_ne!(old_child, new_child);
    let evals = surface.take_evals();
    assert!(evals[0].contains(r#"defineObject("A","#));
    assert!(evals.contains(&format!(
        r#"window.Bridge.__internal.defineObject("A.b","{new_child}");"#
    )));
    assert_eq!(
        evals.last().unwrap(),
        "console.log('[bridge]', \"Bridge init completed.\");"
    );
    assert!(surface.init_script().unwrap().contains(new_child.as_str()));
}

#[tokio::test]
async fn init_with_all_policy_reissues_every_path_without_walking() {
    let config = BridgeConfig {
        init_policy: InitPolicy::All,
        ..BridgeConfig::default()
    };
    let (surface, bridge) = setup(config);
    bridge.define_object("Test", test_object()).unwrap();
    bridge
        .define_object(
            "Test2",
            Arc::new(Child {
                label: ValueCell::new("x".into()),
            }),
        )
        .unwrap();

    surface.take_evals();
    bridge.dispatch(r#"["INIT",{}]"#).unwrap();
    let defined: Vec<String> = surface
        .take_evals()
        .into_iter()
        .filter(|line| line.contains("defineObject"))
        .collect();
    assert_eq!(defined.len(), 2);
    assert!(defined[0].contains(r#"("Test","#));
    assert!(defined[1].contains(r#"("Test2","#));
}

#[tokio::test]
async fn init_with_all_policy_keeps_swapped_children_until_next_define() {
    let config = BridgeConfig {
        init_policy: InitPolicy::All,
        ..BridgeConfig::default()
    };
    let (surface, bridge) = setup(config);
    let parent = parent_with("first");
    bridge.define_object("A", Arc::clone(&parent)).unwrap();
    let old_child = bridge.registry().lookup_path("A.b").unwrap().id().clone();

    *parent.b.lock() = Some(child("second"));
    surface.take_evals();
    bridge.dispatch(r#"["INIT",{}]"#).unwrap();
    assert_eq!(bridge.registry().lookup_path("A.b").unwrap().id(), &old_child);
    assert!(surface.take_evals().contains(&format!(
        r#"window.Bridge.__internal.defineObject("A.b","{old_child}");"#
    )));
    assert!(surface.init_script().unwrap().contains(old_child.as_str()));
}

#[tokio::test]
async fn declared_child_cannot_be_defined_over() {
    let (surface, bridge) = setup(BridgeConfig::default());
    bridge.define_object("A", parent_with("declared")).unwrap();
    let declared = bridge.registry().lookup_path("A.b").unwrap().id().clone();
    surface.take_evals();

    let err = bridge.define_object("A.b", child("explicit")).unwrap_err();
    assert!(matches!(err, BridgeError::DeclaredChild { ref parent, .. } if parent == "A"));
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert!(surface.take_evals().is_empty());
    assert_eq!(bridge.registry().lookup_path("A.b").unwrap().id(), &declared);
    assert_eq!(
        bridge.dispatch(&get(&declared, "label")).unwrap(),
        Some("\"declared\"".into())
    );
}

#[tokio::test]
async fn define_replays_children_the_walk_rebound() {
    let (surface, bridge) = setup(BridgeConfig::default());
    let parent = parent_with("first");
    bridge.define_object("A", Arc::clone(&parent)).unwrap();
    let old_child = bridge.registry().lookup_path("A.b").unwrap().id().clone();

    *parent.b.lock() = Some(child("second"));
    surface.take_evals();
    bridge.define_object("Test", test_object()).unwrap();

    let new_child = bridge.registry().lookup_path("A.b").unwrap().id().clone();
    assert_ne!(new_child, old_child);
    assert!(surface.take_evals().contains(&format!(
        r#"window.Bridge.__internal.defineObject("A.b","{new_child}");"#
    )));
    assert_eq!(
        bridge.dispatch(&get(&new_child, "label")).unwrap(),
        Some("\"second\"".into())
    );
    assert_eq!(
        bridge.dispatch(&get(&old_child, "label")).unwrap_err().kind(),
        ErrorKind::Resolution
    );
}

#[tokio::test]
async fn declared_child_is_removed_through_its_parent() {
    let (surface, bridge) = setup(BridgeConfig::default());
    let parent = parent_with("first");
    bridge.define_object("A", Arc::clone(&parent)).unwrap();
    let declared = bridge.registry().lookup_path("A.b").unwrap().id().clone();
    surface.take_evals();

    let err = bridge.remove_object("A.b").unwrap_err();
    assert!(matches!(err, BridgeError::DeclaredChild { .. }));
    assert!(surface.take_evals().is_empty());
    assert_eq!(bridge.registry().lookup_path("A.b").unwrap().id(), &declared);
    assert!(surface.init_script().unwrap().contains(declared.as_str()));

    *parent.b.lock() = None;
    bridge.dispatch(r#"["INIT",{}]"#).unwrap();
    assert!(bridge.registry().lookup_path("A.b").is_none());
    assert!(surface
        .take_evals()
        .contains(&r#"window.Bridge.__internal.undefineObject("A.b");"#.to_string()));
    assert!(!surface.init_script().unwrap().contains(declared.as_str()));
}

#[test]
fn new_outside_a_runtime_is_an_error() {
    let surface = Arc::new(RecordingSurface::new());
    let err = WebviewBridge::new(surface.clone(), &BridgeConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, BridgeError::NoRuntime(_)));
    assert_eq!(err.kind(), ErrorKind::Setup);
    assert!(!surface.is_bound(BINDING));
}

#[tokio::test]
async fn remove_object_undefines_stub() {
    let (surface, bridge) = setup(BridgeConfig::default());
    let id = bridge.define_object("Test", test_object()).unwrap();
    surface.take_evals();

    bridge.remove_object("Test").unwrap();
    assert_eq!(
        surface.take_evals(),
        vec![r#"window.Bridge.__internal.undefineObject("Test");"#.to_string()]
    );
    assert_eq!(bridge.dispatch(&get(&id, "count")).unwrap_err().kind(), ErrorKind::Resolution);
    assert!(!surface.init_script().unwrap().contains(id.as_str()));
}

#[tokio::test]
async fn emit_broadcasts_to_script_listeners() {
    let (surface, bridge) = setup(BridgeConfig::default());
    bridge.emit("Theme", &json!({"dark": true})).unwrap();
    assert_eq!(
        surface.broadcasts(),
        vec![("Theme".to_string(), json!({"dark": true}))]
    );
}

#[tokio::test]
async fn host_call_can_make_nested_round_trip() {
    let (surface, bridge) = setup(BridgeConfig::default());
    let bridge = Arc::new(bridge);
    let test_id = bridge.define_object("Test", test_object()).unwrap();
    let relay = Arc::new(Relay {
        bridge: Mutex::new(Weak::new()),
    });
    *relay.bridge.lock() = Arc::downgrade(&bridge);
    let relay_id = bridge.define_object("Relay", relay).unwrap();

    bridge.dispatch(&set(&test_id, "count", json!(7))).unwrap();
    let reply = surface.invoke(BINDING, &invoke(&relay_id, "read", json!([test_id, "count"])));
    assert_eq!(reply, Ok(Some("7".into())));
    assert_eq!(bridge.router().in_flight(), 0);
}

#[tokio::test]
async fn close_unbinds_transport() {
    let (surface, bridge) = setup(BridgeConfig::default());
    bridge.define_object("Test", test_object()).unwrap();
    bridge.close();
    assert!(!surface.is_bound(BINDING));
    assert!(bridge.registry().is_empty());
    assert!(surface.invoke(BINDING, r#"["INIT",{}]"#).is_err());
}
