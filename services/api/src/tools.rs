//! The tools the model may call, and how the relay executes them.

use crate::config::FunctionUrls;
use async_trait::async_trait;
use relay_core::{FunctionDeclaration, ToolError, ToolExecutor};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, instrument};

pub const PRINT_BLACKBOARD: &str = "print_blackboard";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Function declarations sent with every session setup.
pub fn tool_declarations() -> Vec<FunctionDeclaration> {
    vec![FunctionDeclaration {
        name: PRINT_BLACKBOARD.to_string(),
        description: "Output the summary of the key concepts and knowledge of the current round \
            of conversation to the user in text form and display them on the blackboard. \
            Scientific formulas should be in standard latex with '$' surroundings and the \
            explanations should include necessary explanations. Also, bold some important terms \
            with '**' surroundings according to the explanation. You cannot and must not output \
            'Step x' on the blackboard, just the key knowledge of the current step."
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "content": {
                    "type": "STRING",
                    "description": "The content need to be displayed on the blackboard, showed to students."
                },
                "explanation_is_finish": {
                    "type": "BOOLEAN",
                    "description": "Indicates whether the tutor's explanation is over. True means explanation is finish, False otherwise"
                }
            },
            "required": ["content", "explanation_is_finish"]
        }),
    }]
}

/// Answers `print_blackboard` locally and forwards the cloud-function tools
/// to their configured endpoints.
pub struct RelayToolExecutor {
    http: reqwest::Client,
    urls: FunctionUrls,
}

impl RelayToolExecutor {
    pub fn new(urls: FunctionUrls) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ToolError::Http(e.to_string()))?;
        Ok(Self { http, urls })
    }

    fn print_blackboard(args: &Value) -> Result<Value, ToolError> {
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: PRINT_BLACKBOARD.to_string(),
                reason: "missing `content`".to_string(),
            })?;
        let explanation_is_finish = args
            .get("explanation_is_finish")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(json!({
            "content": content,
            "explanation_is_finish": explanation_is_finish,
        }))
    }

    async fn call_function(&self, url: &str, args: &Value) -> Result<Value, ToolError> {
        let response = self
            .http
            .post(url)
            .json(args)
            .send()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Http(format!("{url} returned {status}")));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ToolError::Http(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl ToolExecutor for RelayToolExecutor {
    #[instrument(name = "tool", skip(self, args))]
    async fn execute(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        if name == PRINT_BLACKBOARD {
            return Self::print_blackboard(args);
        }
        match self.urls.for_tool(name) {
            Some(url) => {
                info!("Calling cloud function.");
                self.call_function(url, args).await
            }
            None => Err(ToolError::UnknownTool(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use tokio::net::TcpListener;

    async fn spawn_functions() -> String {
        let app = Router::new()
            .route(
                "/weather",
                post(|Json(args): Json<Value>| async move {
                    Json(json!({ "city": args["city"], "temperature": 21 }))
                }),
            )
            .route(
                "/broken",
                post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn blackboard_is_answered_locally() {
        let executor = RelayToolExecutor::new(FunctionUrls::default()).unwrap();

        let result = executor
            .execute(PRINT_BLACKBOARD, &json!({"content": "$E = mc^2$"}))
            .await
            .unwrap();
        assert_eq!(
            result,
            json!({"content": "$E = mc^2$", "explanation_is_finish": false})
        );

        let err = executor
            .execute(PRINT_BLACKBOARD, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn configured_functions_are_posted_their_arguments() {
        let base = spawn_functions().await;
        let executor = RelayToolExecutor::new(FunctionUrls {
            weather: Some(format!("{base}/weather")),
            forecast: Some(format!("{base}/broken")),
            ..Default::default()
        })
        .unwrap();

        let result = executor
            .execute("get_weather", &json!({"city": "Berlin"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"city": "Berlin", "temperature": 21}));

        let err = executor
            .execute("get_weather_forecast", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Http(_)));
    }

    #[tokio::test]
    async fn unconfigured_tools_are_unknown() {
        let executor = RelayToolExecutor::new(FunctionUrls::default()).unwrap();

        let err = executor
            .execute("get_next_appointment", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "get_next_appointment"));
    }

    #[test]
    fn declares_the_blackboard_tool() {
        let declarations = tool_declarations();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].name, PRINT_BLACKBOARD);
        assert_eq!(
            declarations[0].parameters["properties"]["explanation_is_finish"]["type"],
            "BOOLEAN"
        );
    }
}
