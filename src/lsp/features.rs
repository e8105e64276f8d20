//! Typed helpers for common text document requests
//!
//! Each helper builds its parameters with `lsp-types` and returns the raw
//! result value unmodified; interpreting it is the caller's business.

use async_trait::async_trait;
use lsp_types::request::{Completion, GotoDefinition, HoverRequest, References, Request as _};
use lsp_types::{
    CompletionParams, GotoDefinitionParams, HoverParams, PartialResultParams, Position,
    ReferenceContext, ReferenceParams, TextDocumentIdentifier, TextDocumentPositionParams,
    WorkDoneProgressParams,
};
use serde::Serialize;
use serde_json::Value;

use crate::lsp::error::RpcError;
use crate::lsp::handshake::parse_uri;
use crate::lsp::session::RpcSession;

/// A zero-based position inside a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPosition {
    pub uri: String,
    pub line: u32,
    pub character: u32,
}

impl DocumentPosition {
    pub fn new(uri: impl Into<String>, line: u32, character: u32) -> Self {
        Self {
            uri: uri.into(),
            line,
            character,
        }
    }

    fn to_params(&self) -> Result<TextDocumentPositionParams, RpcError> {
        Ok(TextDocumentPositionParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(&self.uri)?,
            },
            position: Position {
                line: self.line,
                character: self.character,
            },
        })
    }
}

#[async_trait]
pub trait TextDocumentFeatures {
    /// `textDocument/completion`
    async fn completion(&self, position: &DocumentPosition) -> Result<Value, RpcError>;

    /// `textDocument/hover`
    async fn hover(&self, position: &DocumentPosition) -> Result<Value, RpcError>;

    /// `textDocument/definition`
    async fn definition(&self, position: &DocumentPosition) -> Result<Value, RpcError>;

    /// `textDocument/references`
    async fn references(
        &self,
        position: &DocumentPosition,
        include_declaration: bool,
    ) -> Result<Value, RpcError>;
}

impl RpcSession {
    async fn feature_request<P: Serialize>(&self, method: &str, params: P) -> Result<Value, RpcError> {
        let params = serde_json::to_value(params)?;
        self.request(method, Some(params)).await
    }
}

#[async_trait]
impl TextDocumentFeatures for RpcSession {
    async fn completion(&self, position: &DocumentPosition) -> Result<Value, RpcError> {
        let params = CompletionParams {
            text_document_position: position.to_params()?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        };
        self.feature_request(Completion::METHOD, params).await
    }

    async fn hover(&self, position: &DocumentPosition) -> Result<Value, RpcError> {
        let params = HoverParams {
            text_document_position_params: position.to_params()?,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.feature_request(HoverRequest::METHOD, params).await
    }

    async fn definition(&self, position: &DocumentPosition) -> Result<Value, RpcError> {
        let params = GotoDefinitionParams {
            text_document_position_params: position.to_params()?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.feature_request(GotoDefinition::METHOD, params).await
    }

    async fn references(
        &self,
        position: &DocumentPosition,
        include_declaration: bool,
    ) -> Result<Value, RpcError> {
        let params = ReferenceParams {
            text_document_position: position.to_params()?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: ReferenceContext {
                include_declaration,
            },
        };
        self.feature_request(References::METHOD, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::session::SessionState;
    use crate::lsp::testing::{ready_session, test_config};
    use serde_json::json;

    const DOC: &str = "file:///workspace/project/src/main.cpp";

    #[tokio::test]
    async fn test_each_feature_sends_its_method() {
        let (session, mut server) = ready_session().await;
        let position = DocumentPosition::new(DOC, 10, 4);

        let cases = [
            ("textDocument/completion", json!({"isIncomplete": false, "items": []})),
            ("textDocument/hover", json!({"contents": "int main()"})),
            ("textDocument/definition", json!([])),
            ("textDocument/references", json!(null)),
        ];

        for (method, reply) in cases {
            let caller = session.clone();
            let pos = position.clone();
            let handle = tokio::spawn(async move {
                match method {
                    "textDocument/completion" => caller.completion(&pos).await,
                    "textDocument/hover" => caller.hover(&pos).await,
                    "textDocument/definition" => caller.definition(&pos).await,
                    _ => caller.references(&pos, true).await,
                }
            });

            let request = server.expect_request(method).await;
            let params = request.params.unwrap();
            assert_eq!(params["textDocument"]["uri"], DOC);
            assert_eq!(params["position"], json!({"line": 10, "character": 4}));
            if method == "textDocument/references" {
                assert_eq!(params["context"], json!({"includeDeclaration": true}));
            }

            server.respond(request.id, reply.clone()).await;
            assert_eq!(handle.await.unwrap().unwrap(), reply);
        }
    }

    #[tokio::test]
    async fn test_invalid_uri_fails_before_sending() {
        let (session, mut server) = ready_session().await;

        let result = session
            .hover(&DocumentPosition::new("not a uri", 0, 0))
            .await;
        assert!(matches!(result, Err(RpcError::InvalidUri { .. })));
        assert_eq!(session.pending_count(), 0);

        // Nothing went out for the bad call; the next message is this one
        let caller = session.clone();
        let handle = tokio::spawn(async move {
            caller
                .definition(&DocumentPosition::new(DOC, 1, 1))
                .await
        });
        let request = server.expect_request("textDocument/definition").await;
        server.respond(request.id, json!([])).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_features_require_ready_session() {
        let session = RpcSession::new(test_config());
        let result = session
            .completion(&DocumentPosition::new(DOC, 0, 0))
            .await;
        assert!(matches!(
            result,
            Err(RpcError::NotReady {
                state: SessionState::NotStarted
            })
        ));
    }
}
