use crate::control::ControlPlane;
use crate::countries;
use crate::error::ControlError;
use crate::events::SessionEvent;
use crate::model::{Country, Node, StatusResponse};
use crate::orchestrator::NodeOrchestrator;

#[derive(Debug)]
pub enum ToggleOutcome {
    Started { country: Country, node: Node },
    Stopped { country: Country, node_id: String, response: StatusResponse },
}

/// Flips one country's exit node: a running node is stopped, anything else is started.
///
/// The country is validated before any request is made, and exactly one mutation is issued.
pub async fn quick_toggle<C: ControlPlane + 'static>(
    orchestrator: &NodeOrchestrator<C>,
    input: &str,
) -> Result<ToggleOutcome, ControlError> {
    let code = input.trim().to_lowercase();
    let Some(country) = countries::lookup(&code) else {
        let err = ControlError::InvalidCountry(input.to_string());
        orchestrator.emit(SessionEvent::failure("Invalid Country Code", err.to_string()));
        return Err(err);
    };

    let nodes = orchestrator.refresh().await?;
    let existing = nodes.iter().find(|node| node.country == country.code).cloned();

    match existing {
        Some(node) if node.is_running() => {
            let response = orchestrator.stop(&node).await?;
            Ok(ToggleOutcome::Stopped {
                country,
                node_id: node.id,
                response,
            })
        }
        _ => {
            let node = orchestrator.start(&country.code, None).await?;
            Ok(ToggleOutcome::Started { country, node })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeStatus;
    use crate::store::SessionStore;
    use crate::testing::{node, FakeControlPlane, RecordingObserver};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(
        nodes: Vec<Node>,
    ) -> (
        Arc<FakeControlPlane>,
        NodeOrchestrator<FakeControlPlane>,
        SessionStore,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("store.json"));
        let fake = Arc::new(FakeControlPlane::with_nodes(nodes));
        let orchestrator = NodeOrchestrator::new(
            fake.clone(),
            Some(store.clone()),
            Arc::new(RecordingObserver::default()),
            Duration::from_secs(30),
        );
        (fake, orchestrator, store, dir)
    }

    #[tokio::test]
    async fn running_node_is_stopped() {
        let (fake, orch, store, _dir) = setup(vec![node("vpn-us", "us", NodeStatus::Running)]);
        let outcome = quick_toggle(&orch, "us").await.expect("toggle");
        assert!(matches!(outcome, ToggleOutcome::Stopped { ref node_id, .. } if node_id == "vpn-us"));
        assert_eq!(fake.stop_calls(), 1);
        assert_eq!(fake.start_calls(), 0);
        assert!(store.recent_countries().is_empty());
    }

    #[tokio::test]
    async fn missing_node_is_started_and_recorded() {
        let (fake, orch, store, _dir) = setup(vec![node("vpn-de", "de", NodeStatus::Running)]);
        let outcome = quick_toggle(&orch, " US ").await.expect("toggle");
        match outcome {
            ToggleOutcome::Started { country, node } => {
                assert_eq!(country.code, "us");
                assert_eq!(node.country, "us");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fake.start_calls(), 1);
        assert_eq!(fake.stop_calls(), 0);
        assert_eq!(store.recent_countries(), vec!["us"]);
    }

    #[tokio::test]
    async fn stopped_or_errored_node_is_started() {
        for status in [NodeStatus::Stopped, NodeStatus::Error] {
            let (fake, orch, _store, _dir) = setup(vec![node("vpn-jp", "jp", status)]);
            let outcome = quick_toggle(&orch, "jp").await.expect("toggle");
            assert!(matches!(outcome, ToggleOutcome::Started { .. }));
            assert_eq!(fake.start_calls(), 1);
            assert_eq!(fake.stop_calls(), 0);
        }
    }

    #[tokio::test]
    async fn unknown_country_fails_before_any_request() {
        let (fake, orch, _store, _dir) = setup(Vec::new());
        let err = quick_toggle(&orch, "xx").await.unwrap_err();
        assert_eq!(err, ControlError::InvalidCountry("xx".to_string()));
        assert_eq!(fake.list_calls(), 0);
        assert_eq!(fake.start_calls(), 0);
        assert_eq!(fake.stop_calls(), 0);
    }

    #[tokio::test]
    async fn failed_lookup_issues_no_mutation() {
        let (fake, orch, _store, _dir) = setup(Vec::new());
        fake.fail_list(ControlError::Transport("timed out".to_string()));
        assert!(quick_toggle(&orch, "de").await.is_err());
        assert_eq!(fake.start_calls(), 0);
        assert_eq!(fake.stop_calls(), 0);
    }
}
