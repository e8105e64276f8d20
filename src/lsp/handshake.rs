//! Initialize handshake parameters
//!
//! The client advertises one fixed capability set regardless of which server
//! it talks to. Anything the server offers beyond it is simply unused.

use std::str::FromStr;

use lsp_types::{
    ClientCapabilities, ClientInfo, CompletionClientCapabilities, CompletionItemCapability,
    GeneralClientCapabilities, GotoCapability, HoverClientCapabilities, InitializeParams,
    MarkupKind, PublishDiagnosticsClientCapabilities, ReferenceClientCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities, TraceValue, Uri,
    WindowClientCapabilities, WorkDoneProgressParams, WorkspaceClientCapabilities,
    WorkspaceFolder,
};
use tracing::debug;

use crate::config::SessionConfig;
use crate::lsp::error::RpcError;

/// Parse a URI string, mapping failures to `RpcError::InvalidUri`
pub fn parse_uri(uri: &str) -> Result<Uri, RpcError> {
    if uri.trim().is_empty() {
        return Err(RpcError::invalid_uri(uri, "URI is empty"));
    }
    Uri::from_str(uri).map_err(|e| RpcError::invalid_uri(uri, format!("{e:?}")))
}

/// The static capability set sent with every `initialize`
pub fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            workspace_folders: Some(true),
            configuration: Some(false),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
                did_save: Some(true),
            }),
            completion: Some(CompletionClientCapabilities {
                dynamic_registration: Some(false),
                completion_item: Some(CompletionItemCapability {
                    snippet_support: Some(false),
                    documentation_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(false),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            definition: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(false),
            }),
            references: Some(ReferenceClientCapabilities {
                dynamic_registration: Some(false),
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        general: Some(GeneralClientCapabilities::default()),
        experimental: None,
        notebook_document: None,
    }
}

/// Build `initialize` parameters for a workspace rooted at `root`
///
/// `root` must already be a URI (e.g. `file:///work/project`).
pub fn initialize_params(root: &str, config: &SessionConfig) -> Result<InitializeParams, RpcError> {
    let root_uri = parse_uri(root)?;
    let folder_name = root
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(root)
        .to_string();

    debug!("Building initialize params for root {}", root);

    Ok(InitializeParams {
        process_id: Some(std::process::id()),
        #[allow(deprecated)]
        root_path: None,
        #[allow(deprecated)]
        root_uri: Some(root_uri.clone()),
        initialization_options: config.initialization_options.clone(),
        capabilities: client_capabilities(),
        trace: Some(TraceValue::Off),
        workspace_folders: Some(vec![WorkspaceFolder {
            uri: root_uri,
            name: folder_name,
        }]),
        client_info: Some(ClientInfo {
            name: config.client_name.clone(),
            version: Some(config.client_version.clone()),
        }),
        locale: None,
        work_done_progress_params: WorkDoneProgressParams::default(),
    })
}
