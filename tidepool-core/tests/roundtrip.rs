//! Wire-shape tests for `tidepool-core` payload types.
//!
//! Each `#[case]` is isolated: no shared state.

use rstest::rstest;
use serde_json::{json, Value};
use tidepool_core::{AssetKind, AssetPath, ProjectName, ProjectPayload, SubmitBody, Update};

#[rstest]
#[case::module(AssetKind::Module, "Module")]
#[case::server(AssetKind::ServerExecutable, "ServerExecutable")]
#[case::client(AssetKind::ClientExecutable, "ClientExecutable")]
fn asset_kind_wire_names(#[case] kind: AssetKind, #[case] expected: &str) {
    assert_eq!(serde_json::to_value(kind).unwrap(), json!(expected));
    assert_eq!(expected.parse::<AssetKind>().unwrap(), kind);
}

#[rstest]
#[case::change(
    Update::change(AssetPath::from_iter(["sub", "b"]), AssetKind::Module, "return 1"),
    json!({ "path": ["sub", "b"], "type": "Module", "source": "return 1" })
)]
#[case::remove(
    Update::remove(AssetPath::from_iter(["a"]), AssetKind::ServerExecutable),
    json!({ "path": ["a"], "type": "ServerExecutable", "source": null })
)]
#[case::root_node(
    Update::change(AssetPath::default(), AssetKind::Module, ""),
    json!({ "path": [], "type": "Module", "source": "" })
)]
fn update_json_shape(#[case] update: Update, #[case] expected: Value) {
    assert_eq!(serde_json::to_value(&update).unwrap(), expected);
    let back: Update = serde_json::from_value(expected).unwrap();
    assert_eq!(back, update);
}

#[test]
fn long_poll_response_is_an_array_of_project_payloads() {
    let response = vec![ProjectPayload {
        project_name: ProjectName::from("p"),
        changes: vec![Update::change(
            AssetPath::from_iter(["a"]),
            AssetKind::ServerExecutable,
            "print('hi')",
        )],
        initial: true,
    }];
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(
        value,
        json!([{
            "projectName": "p",
            "changes": [{ "path": ["a"], "type": "ServerExecutable", "source": "print('hi')" }],
            "initial": true
        }])
    );
}

#[test]
fn submit_body_rejects_unknown_kind() {
    let err = serde_json::from_str::<SubmitBody>(
        r#"{"projectName":"p","changes":[{"path":["x"],"type":"Folder","source":"x"}]}"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("Folder"));
}
