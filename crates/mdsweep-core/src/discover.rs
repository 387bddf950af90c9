// ── Fleet discovery ──
//
// Membership comes from the manager's own inventory: `show switches`,
// prefiltered to devices that are actually up. The caller's filter can
// only narrow that set further -- it is appended after the prefilter,
// never substituted for it.

use tracing::debug;

use crate::error::CoreError;
use crate::filter::{FilterChain, project};
use crate::fleet::FleetSession;

/// Always applied, not overridable: only devices the manager reports up
/// are worth dialing.
const UP_PREFILTER: &str = "$.All_Switches[?(@.Status == 'up')]";

/// The inventory attribute holding each device's address.
const ADDRESS_ATTR: &str = "IP_Address";

/// Resolve fleet membership through one session against the manager.
///
/// Returns the device addresses, one per discovered target, in inventory
/// order.
pub async fn discover<S: FleetSession>(
    session: &mut S,
    filter: Option<&FilterChain>,
) -> Result<Vec<String>, CoreError> {
    let mut chain = FilterChain::compile(UP_PREFILTER)?;
    if let Some(extra) = filter {
        chain.extend(extra.clone());
    }

    session.dial().await?;
    let inventory = session.show("show switches").await?;
    let shaped = chain.eval(inventory)?;

    let targets = project(&shaped, Some(&[ADDRESS_ATTR.to_owned()]))?
        .into_iter()
        .filter(|addr| !addr.is_empty())
        .collect::<Vec<_>>();
    debug!(count = targets.len(), "fleet discovered");
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    use crate::fleet::SessionApi;
    use mdsweep_api::Error as ApiError;

    struct InventorySession {
        payload: Value,
    }

    impl SessionApi for InventorySession {
        fn target(&self) -> &str {
            "manager"
        }

        fn api_get<'a>(
            &'a mut self,
            _cfg_path: &'a str,
            _endpoint: &'a str,
            _params: Vec<(String, String)>,
        ) -> BoxFuture<'a, Result<Value, ApiError>> {
            Box::pin(async { Ok(Value::Null) })
        }

        fn api_post<'a>(
            &'a mut self,
            _cfg_path: &'a str,
            _endpoint: &'a str,
            _body: Option<Value>,
        ) -> BoxFuture<'a, Result<Value, ApiError>> {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    impl FleetSession for InventorySession {
        async fn dial(&mut self) -> Result<(), ApiError> {
            Ok(())
        }

        async fn show(&mut self, command: &str) -> Result<Value, ApiError> {
            assert_eq!(command, "show switches");
            Ok(self.payload.clone())
        }

        async fn exec_shell(
            &mut self,
            _command_line: &str,
            _stdin: Option<&str>,
        ) -> Result<String, ApiError> {
            unreachable!("discovery never uses the shell")
        }

        async fn close(&mut self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn inventory() -> Value {
        json!({"All_Switches": [
            {"Status": "up", "IP_Address": "10.0.0.1", "Model": "A7010"},
            {"Status": "down", "IP_Address": "10.0.0.2", "Model": "A7010"},
            {"Status": "up", "IP_Address": "10.0.0.3", "Model": "A7030"},
        ]})
    }

    #[tokio::test]
    async fn prefilter_drops_devices_that_are_not_up() {
        let mut session = InventorySession {
            payload: inventory(),
        };
        let targets = discover(&mut session, None).await.unwrap();
        assert_eq!(targets, vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn caller_filter_narrows_but_never_replaces_the_prefilter() {
        let mut session = InventorySession {
            payload: inventory(),
        };
        let all_up = discover(&mut session, None).await.unwrap();

        // A filter that would match the down device on its own still
        // cannot resurrect it.
        let chain = FilterChain::compile("?(@.Model == 'A7010')").unwrap();
        let narrowed = discover(&mut session, Some(&chain)).await.unwrap();
        assert_eq!(narrowed, vec!["10.0.0.1"]);
        assert!(narrowed.iter().all(|t| all_up.contains(t)));
    }

    #[tokio::test]
    async fn single_up_device_scenario() {
        let mut session = InventorySession {
            payload: json!({"All_Switches": [
                {"Status": "up", "IP_Address": "10.0.0.1"},
                {"Status": "down", "IP_Address": "10.0.0.2"},
            ]}),
        };
        let targets = discover(&mut session, None).await.unwrap();
        assert_eq!(targets, vec!["10.0.0.1"]);
    }
}
