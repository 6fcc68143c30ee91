//! End-to-end behavior of the pipeline over fake pages and scripted models.

use std::sync::Arc;
use std::time::Duration;

use super::{FakePage, MemoryStore, ScriptedModel};
use crate::command::{ActionType, Command, Instruction, LocatorSpec, Selector};
use crate::decompose::Decomposer;
use crate::gate::ValidationGate;
use crate::markup::StaticMarkup;
use crate::orchestrator::Healer;
use crate::planner::Planner;
use crate::snapshot::PageSnapshot;
use crate::subtask::{Subtask, SubtaskStatus};
use crate::validator::{validate, Validator};

const LOGIN_PAGE: &str = r#"<html><body><button class="login-btn">Login</button></body></html>"#;

#[tokio::test]
async fn click_the_login_button() {
    let snapshot = PageSnapshot::new(LOGIN_PAGE);
    let model = Arc::new(ScriptedModel::new([
        "1. Click the login button",
        r#"{"action": "click", "locator": {"primary": "css-class:login-btn", "fallbacks": []}}"#,
    ]));

    let steps = Planner::new(model.clone())
        .plan(&Instruction::new("Click the login button"), &snapshot)
        .await;
    assert_eq!(steps.len(), 1);

    let unit = Decomposer::new(
        Arc::new(ScriptedModel::new([
            "1. Click the login button",
            r#"{"action": "click", "locator": "css-class:login-btn"}"#,
        ])),
        Arc::new(StaticMarkup::new(LOGIN_PAGE)),
    )
    .decompose(&Instruction::new("Click the login button"))
    .await;

    assert_eq!(unit.commands.len(), 1);
    let command = &unit.commands[0];
    assert_eq!(command.action, ActionType::Click);
    assert_eq!(
        command.locator,
        Some(LocatorSpec::new(Selector::CssClass("login-btn".into())))
    );
    assert!(validate(command, &snapshot).valid);
    assert!(!command.unverified);
}

#[tokio::test]
async fn ambiguous_text_gets_a_new_locator() {
    let snapshot = PageSnapshot::new(
        r#"<form id="a"><button id="save">Submit</button></form>
           <form id="b"><button id="send">Submit</button></form>"#,
    );
    let command = Command::targeting(ActionType::Click, Selector::Text("Submit".into()));
    let outcome = validate(&command, &snapshot);
    assert!(outcome.ambiguous);
    assert!(!outcome.valid);

    let model = Arc::new(ScriptedModel::new([r#"{"action": "click", "locator": "css:#save"}"#]));
    let gate = ValidationGate::new(model.clone(), Validator::default());
    let refined = gate.refine(&command, &outcome, &snapshot, 1).await;

    assert_eq!(model.calls(), 1);
    assert_ne!(refined.locator, command.locator);
    assert!(validate(&refined, &snapshot).valid);
}

#[tokio::test]
async fn missing_password_field_exhausts_healing() {
    let page = Arc::new(FakePage::new(LOGIN_PAGE));
    let model = Arc::new(ScriptedModel::new([
        r#"{"action": "type", "locator": {"primary": "css:#password", "fallbacks": ["placeholder:Password"]}, "value": "secret"}"#,
        r#"{"action": "type", "locator": {"primary": "test-id:password", "fallbacks": ["css-attribute:[name=password]"]}, "value": "secret"}"#,
    ]));
    let unit = Subtask::new(
        "enter the password",
        vec![Command::targeting(
            ActionType::Type,
            Selector::Css("input[type=password]".into()),
        )
        .with_value("secret")],
    );

    let unit = Healer::new(page, model.clone())
        .with_step_timeout(Duration::from_millis(20))
        .execute_with_healing(unit)
        .await
        .unwrap();

    assert_eq!(unit.status(), SubtaskStatus::Failed);
    let result = unit.result().unwrap();
    assert!(!result.error.as_deref().unwrap_or("").trim().is_empty());
    assert_eq!(result.failure_history.len(), 3);
    assert_eq!(result.healing_attempts, 2);

    let tried: Vec<&Command> = result
        .failure_history
        .iter()
        .map(|c| &c.failed_command)
        .collect();
    assert_ne!(tried[0], tried[1]);
    assert_ne!(tried[1], tried[2]);
    assert_ne!(tried[0], tried[2]);

    // The last repair prompt lists both earlier attempts
    let last_prompt = model.prompts().pop().unwrap();
    assert!(last_prompt.contains("input[type=password]"));
    assert!(last_prompt.contains("css:#password"));
}

#[tokio::test]
async fn healed_artifact_is_written_once() {
    let original = vec![
        Command::targeting(ActionType::Click, Selector::Text("Sign in".into())),
        Command::new(ActionType::Press).with_value("Enter"),
    ];
    let store = Arc::new(MemoryStore::default().with_file("login.yaml", original));
    let page = Arc::new(FakePage::new(LOGIN_PAGE));
    let model = Arc::new(ScriptedModel::new([
        r#"{"action": "click", "locator": "css-class:login-btn"}"#,
    ]));
    let healer = Healer::new(page, model.clone())
        .with_step_timeout(Duration::from_millis(20))
        .with_store(store.clone());

    let first = Subtask::new("log in", store.commands("login.yaml")).from_artifact("login.yaml", 0);
    let first = healer.execute_with_healing(first).await.unwrap();
    assert_eq!(first.status(), SubtaskStatus::Completed);
    assert_eq!(store.writes(), 1);
    assert!(store.commands("login.yaml")[0].healed);

    let second = Subtask::new("log in", store.commands("login.yaml")).from_artifact("login.yaml", 0);
    let second = healer.execute_with_healing(second).await.unwrap();
    assert_eq!(second.status(), SubtaskStatus::Completed);
    assert_eq!(store.writes(), 1);
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn healing_never_exceeds_max_attempts() {
    for max_attempts in 1..=4 {
        let page = Arc::new(FakePage::new(LOGIN_PAGE));
        let replies: Vec<String> = (0..10)
            .map(|i| format!(r#"{{"action": "click", "locator": "css-class:missing-{i}"}}"#))
            .collect();
        let model = Arc::new(ScriptedModel::new(replies));
        let unit = Subtask::new(
            "click",
            vec![Command::targeting(ActionType::Click, Selector::CssClass("gone".into()))],
        );

        let unit = Healer::new(page.clone(), model)
            .with_step_timeout(Duration::from_millis(10))
            .with_max_attempts(max_attempts)
            .execute_with_healing(unit)
            .await
            .unwrap();

        assert_eq!(unit.status(), SubtaskStatus::Failed);
        let history = &unit.result().unwrap().failure_history;
        assert_eq!(history.len(), max_attempts as usize);
        assert_eq!(page.queried().len(), max_attempts as usize);
    }
}

#[tokio::test]
async fn field_revealed_by_an_earlier_click_resolves_live() {
    let revealed = r#"<html><body>
        <button class="login-menu">Account</button>
        <input type="password" name="password">
    </body></html>"#;
    let page = Arc::new(
        FakePage::new(r#"<html><body><button class="login-menu">Account</button></body></html>"#)
            .reveal_on_click("css-class:login-menu", revealed),
    );

    let snapshot = PageSnapshot::new(page.markup());
    let fill = Command::targeting(ActionType::Type, Selector::Css("input[type=password]".into()))
        .with_value("secret");
    let outcome = validate(&fill, &snapshot);
    assert!(outcome.valid);
    assert!(outcome.deferred);

    let unit = Subtask::new(
        "log in",
        vec![
            Command::targeting(ActionType::Click, Selector::CssClass("login-menu".into())),
            fill,
        ],
    );
    let model = Arc::new(ScriptedModel::default());
    let unit = Healer::new(page.clone(), model.clone())
        .with_step_timeout(Duration::from_millis(20))
        .execute_with_healing(unit)
        .await
        .unwrap();

    assert_eq!(unit.status(), SubtaskStatus::Completed);
    assert_eq!(model.calls(), 0);
    assert_eq!(
        page.actions(),
        vec![
            "click css-class:login-menu".to_string(),
            "type css:input[type=password] secret".to_string(),
        ]
    );
}

#[tokio::test]
async fn decompose_always_yields_a_command() {
    let replies = ["", "Sorry, I can't do that.", "Steps:", "1.", "{\"action\": \"fly\"}"];
    for reply in replies {
        let model = Arc::new(ScriptedModel::new([reply, reply, reply, reply, reply]));
        let unit = Decomposer::new(model, Arc::new(StaticMarkup::new(LOGIN_PAGE)))
            .decompose(&Instruction::new("Open the account menu"))
            .await;
        assert!(!unit.commands.is_empty(), "reply {reply:?} gave an empty unit");
    }
}
