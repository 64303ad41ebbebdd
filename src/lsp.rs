use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tower_lsp::jsonrpc::Result as LspResult;
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, ExecuteCommandOptions, ExecuteCommandParams, Hover,
    HoverContents, HoverParams, InitializeParams, InitializeResult, InitializedParams,
    MarkupContent, MarkupKind, MessageActionItem, MessageType, Position, ServerCapabilities,
    ShowDocumentParams, TextDocumentSyncCapability, TextDocumentSyncKind, Url,
};
use tower_lsp::{Client, LanguageServer, LspService, Server};

use crate::config::AppConfig;
use crate::position::Buffer;
use crate::prompt::{self, Prompter};
use crate::session::{Highlight, LoadOutcome, SessionManager};

const COMMAND_LOAD_REVIEW: &str = "gerrit-review.loadReview";
const COMMAND_GO_TO_COMMENT: &str = "gerrit-review.goToComment";
const DIAGNOSTIC_SOURCE: &str = "gerrit";

pub fn run(config: AppConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    runtime.block_on(async move {
        let stdin = tokio::io::stdin();
        let stdout = tokio::io::stdout();
        let (service, socket) =
            LspService::new(|client| Backend::new(client, config.session_manager()));
        Server::new(stdin, stdout, socket).serve(service).await;
    });

    Ok(())
}

/// Selection prompts as `window/showMessageRequest`; dismissing it cancels.
struct LspPrompter {
    client: Client,
}

#[async_trait]
impl Prompter for LspPrompter {
    async fn pick(&self, placeholder: &str, items: &[String]) -> Option<usize> {
        let actions = items
            .iter()
            .map(|title| MessageActionItem {
                title: title.clone(),
                properties: HashMap::new(),
            })
            .collect();
        match self
            .client
            .show_message_request(MessageType::INFO, placeholder, Some(actions))
            .await
        {
            Ok(Some(choice)) => items.iter().position(|item| *item == choice.title),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%err, "selection prompt failed");
                None
            }
        }
    }
}

struct Backend {
    client: Client,
    session: SessionManager,
    roots: RwLock<Vec<PathBuf>>,
    /// Open documents and their current text; these are the visible buffers.
    documents: RwLock<HashMap<Url, String>>,
}

impl Backend {
    fn new(client: Client, session: SessionManager) -> Self {
        Self {
            client,
            session,
            roots: RwLock::default(),
            documents: RwLock::default(),
        }
    }

    fn prompter(&self) -> LspPrompter {
        LspPrompter {
            client: self.client.clone(),
        }
    }

    async fn log_error(&self, err: impl std::fmt::Display) {
        tracing::warn!(%err, "gerrit-review error");
        self.client
            .log_message(MessageType::ERROR, format!("gerrit-review: {err}"))
            .await;
    }

    async fn buffers(&self) -> Vec<(Url, Buffer)> {
        self.documents
            .read()
            .await
            .iter()
            .filter_map(|(uri, text)| {
                // Untitled and other non-file documents have nothing to review.
                let path = uri.to_file_path().ok()?;
                Some((uri.clone(), Buffer::new(path, text)))
            })
            .collect()
    }

    /// Re-publishes highlights for every open document.
    async fn render(&self) {
        let (uris, buffers): (Vec<Url>, Vec<Buffer>) = self.buffers().await.into_iter().unzip();
        let Some(rendered) = self.session.on_visible_buffers_changed(&buffers).await else {
            return;
        };
        for (uri, buffer) in uris.into_iter().zip(rendered) {
            tracing::debug!(
                path = %buffer.path.display(),
                highlights = buffer.highlights.len(),
                "publishing highlights"
            );
            let diagnostics = buffer.highlights.iter().map(to_diagnostic).collect();
            self.client.publish_diagnostics(uri, diagnostics, None).await;
        }
    }

    async fn highlights_for(&self, uri: &Url) -> Vec<Highlight> {
        let Ok(path) = uri.to_file_path() else {
            return Vec::new();
        };
        let Some(text) = self.documents.read().await.get(uri).cloned() else {
            return Vec::new();
        };
        let Some(session) = self.session.current().await else {
            return Vec::new();
        };
        session.highlights(&Buffer::new(path, &text), self.session.hide_resolved())
    }

    async fn hover_for(&self, uri: &Url, position: Position) -> Option<Hover> {
        let hovers: Vec<String> = self
            .highlights_for(uri)
            .await
            .into_iter()
            .filter(|h| contains(h, position))
            .map(|h| h.hover)
            .collect();
        if hovers.is_empty() {
            return None;
        }
        Some(Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: hovers.join("\n\n---\n\n"),
            }),
            range: None,
        })
    }

    async fn load_review(&self) {
        let candidates = self.roots.read().await.clone();
        match self
            .session
            .load_workspace(&candidates, &self.prompter())
            .await
        {
            Ok(LoadOutcome::Loaded(session)) => {
                let change = session.change();
                self.client
                    .show_message(
                        MessageType::INFO,
                        format!(
                            "Comments loaded for change {}/{}.",
                            change.change, change.patchset
                        ),
                    )
                    .await;
                self.render().await;
            }
            Ok(LoadOutcome::Cancelled) => tracing::debug!("review load cancelled"),
            Ok(LoadOutcome::Superseded) => tracing::debug!("review load superseded"),
            Err(err) => {
                self.log_error(&err).await;
                self.client
                    .show_message(
                        MessageType::ERROR,
                        format!("Unable to load code review: {err}"),
                    )
                    .await;
            }
        }
    }

    async fn go_to_comment(&self) {
        let Some(session) = self.session.current().await else {
            return;
        };
        let Some(file) = prompt::choose(
            &self.prompter(),
            "Select file with comments to open.",
            session.files_with_comments(),
            Clone::clone,
        )
        .await
        else {
            return;
        };
        let Ok(uri) = Url::from_file_path(session.target.repo_root.join(&file)) else {
            return;
        };
        let params = ShowDocumentParams {
            uri,
            external: Some(false),
            take_focus: Some(true),
            selection: None,
        };
        if let Err(err) = self.client.show_document(params).await {
            self.log_error(err).await;
        }
    }
}

fn contains(highlight: &Highlight, position: Position) -> bool {
    let at = (position.line, position.character);
    let start = (highlight.range.start.line, highlight.range.start.character);
    let end = (highlight.range.end.line, highlight.range.end.character);
    start <= at && at <= end
}

fn to_diagnostic(highlight: &Highlight) -> Diagnostic {
    let severity = if highlight.unresolved {
        DiagnosticSeverity::WARNING
    } else {
        DiagnosticSeverity::HINT
    };
    Diagnostic {
        range: highlight.range,
        severity: Some(severity),
        source: Some(DIAGNOSTIC_SOURCE.to_string()),
        message: highlight.hover.clone(),
        ..Default::default()
    }
}

#[allow(deprecated)]
fn workspace_roots(params: &InitializeParams) -> Vec<PathBuf> {
    let from_folders: Vec<PathBuf> = params
        .workspace_folders
        .iter()
        .flatten()
        .filter(|folder| folder.uri.scheme() == "file")
        .filter_map(|folder| folder.uri.to_file_path().ok())
        .collect();
    if !from_folders.is_empty() {
        return from_folders;
    }
    params
        .root_uri
        .as_ref()
        .and_then(|uri| uri.to_file_path().ok())
        .into_iter()
        .collect()
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> LspResult<InitializeResult> {
        *self.roots.write().await = workspace_roots(&params);
        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::FULL,
                )),
                hover_provider: Some(true.into()),
                execute_command_provider: Some(ExecuteCommandOptions {
                    commands: vec![
                        COMMAND_LOAD_REVIEW.to_string(),
                        COMMAND_GO_TO_COMMENT.to_string(),
                    ],
                    work_done_progress_options: Default::default(),
                }),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "gerrit-review initialized")
            .await;
    }

    async fn shutdown(&self) -> LspResult<()> {
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        self.documents
            .write()
            .await
            .insert(params.text_document.uri, params.text_document.text);
        self.render().await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Some(change) = params.content_changes.into_iter().last() else {
            return;
        };
        self.documents
            .write()
            .await
            .insert(params.text_document.uri, change.text);
        self.render().await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        self.documents.write().await.remove(&uri);
        self.client.publish_diagnostics(uri, Vec::new(), None).await;
        self.render().await;
    }

    async fn hover(&self, params: HoverParams) -> LspResult<Option<Hover>> {
        Ok(self
            .hover_for(
                &params.text_document_position_params.text_document.uri,
                params.text_document_position_params.position,
            )
            .await)
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> LspResult<Option<Value>> {
        match params.command.as_str() {
            COMMAND_LOAD_REVIEW => self.load_review().await,
            COMMAND_GO_TO_COMMENT => self.go_to_comment().await,
            other => tracing::debug!(command = other, "unknown command"),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tower_lsp::lsp_types::Range;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::git::DEFAULT_MAX_OUTPUT;
    use crate::test_support::{RepoFixture, write_remote};

    #[test]
    fn diagnostics_carry_hover_text_and_severity() {
        let highlight = Highlight {
            range: Range::new(Position::new(9, 0), Position::new(9, 4)),
            hover: "Bob: fix".to_string(),
            unresolved: true,
        };
        let diag = to_diagnostic(&highlight);
        assert_eq!(diag.range, highlight.range);
        assert_eq!(diag.message, "Bob: fix");
        assert_eq!(diag.source.as_deref(), Some("gerrit"));
        assert_eq!(diag.severity, Some(DiagnosticSeverity::WARNING));

        let resolved = Highlight {
            unresolved: false,
            ..highlight
        };
        assert_eq!(
            to_diagnostic(&resolved).severity,
            Some(DiagnosticSeverity::HINT)
        );
    }

    #[test]
    fn contains_is_inclusive() {
        let highlight = Highlight {
            range: Range::new(Position::new(1, 2), Position::new(3, 4)),
            hover: String::new(),
            unresolved: false,
        };
        assert!(contains(&highlight, Position::new(1, 2)));
        assert!(contains(&highlight, Position::new(2, 99)));
        assert!(contains(&highlight, Position::new(3, 4)));
        assert!(!contains(&highlight, Position::new(1, 1)));
        assert!(!contains(&highlight, Position::new(3, 5)));
    }

    #[test]
    fn workspace_folders_win_over_root_uri() {
        let params: InitializeParams = serde_json::from_value(serde_json::json!({
            "processId": null,
            "rootUri": "file:///root",
            "capabilities": {},
            "workspaceFolders": [
                {"uri": "file:///a", "name": "a"},
                {"uri": "untitled:b", "name": "b"}
            ]
        }))
        .expect("params");
        assert_eq!(workspace_roots(&params), vec![PathBuf::from("/a")]);

        let params: InitializeParams = serde_json::from_value(serde_json::json!({
            "processId": null,
            "rootUri": "file:///root",
            "capabilities": {}
        }))
        .expect("params");
        assert_eq!(workspace_roots(&params), vec![PathBuf::from("/root")]);
    }

    async fn write_lsp_message<W: tokio::io::AsyncWrite + Unpin>(
        write: &mut W,
        value: serde_json::Value,
    ) {
        use tokio::io::AsyncWriteExt;
        let body = serde_json::to_string(&value).expect("serialize");
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        write.write_all(header.as_bytes()).await.expect("write header");
        write.write_all(body.as_bytes()).await.expect("write body");
        write.flush().await.expect("flush");
    }

    async fn read_lsp_message<R: tokio::io::AsyncRead + Unpin>(read: &mut R) -> serde_json::Value {
        use tokio::io::AsyncReadExt;
        let mut header = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            read.read_exact(&mut byte).await.expect("read header byte");
            header.push(byte[0]);
            if header.ends_with(b"\r\n\r\n") {
                break;
            }
        }

        let header_str = String::from_utf8(header).expect("header utf8");
        let mut content_length = None;
        for line in header_str.lines() {
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(value.trim().parse::<usize>().expect("length"));
            }
        }
        let len = content_length.expect("content-length");
        let mut body = vec![0u8; len];
        read.read_exact(&mut body).await.expect("read body");
        serde_json::from_slice(&body).expect("json")
    }

    async fn wait_for_message<F, R>(read: &mut R, mut f: F) -> serde_json::Value
    where
        F: FnMut(&serde_json::Value) -> bool,
        R: tokio::io::AsyncRead + Unpin,
    {
        let fut = async {
            loop {
                let msg = read_lsp_message(read).await;
                if f(&msg) {
                    return msg;
                }
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(10), fut)
            .await
            .expect("timeout")
    }

    fn is_method(msg: &serde_json::Value, name: &str) -> bool {
        msg.get("method").and_then(|m| m.as_str()) == Some(name)
    }

    struct Harness {
        read: ReadHalf<DuplexStream>,
        write: WriteHalf<DuplexStream>,
        server_task: tokio::task::JoinHandle<()>,
    }

    async fn start_server(fixture: &RepoFixture, gerrit_url: String) -> Harness {
        let config = AppConfig {
            gerrit_url: Some(gerrit_url),
            remote: None,
            git_max_output: DEFAULT_MAX_OUTPUT,
            hide_resolved: false,
        };
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let (service, socket) =
            LspService::new(|client| Backend::new(client, config.session_manager()));
        let (server_read, server_write) = tokio::io::split(server_stream);
        let server_task = tokio::spawn(async move {
            Server::new(server_read, server_write, socket)
                .serve(service)
                .await
        });

        let (mut read, mut write) = tokio::io::split(client_stream);
        let root_uri = Url::from_directory_path(fixture.root()).expect("root uri");
        write_lsp_message(
            &mut write,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "processId": null,
                    "rootUri": root_uri,
                    "capabilities": {}
                }
            }),
        )
        .await;
        let _init = wait_for_message(&mut read, |msg| msg.get("id") == Some(&1.into())).await;
        write_lsp_message(
            &mut write,
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "initialized",
                "params": {}
            }),
        )
        .await;

        Harness {
            read,
            write,
            server_task,
        }
    }

    async fn open_document<W: tokio::io::AsyncWrite + Unpin>(write: &mut W, uri: &Url, text: &str) {
        write_lsp_message(
            write,
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "textDocument/didOpen",
                "params": {
                    "textDocument": {
                        "uri": uri,
                        "languageId": "typescript",
                        "version": 1,
                        "text": text
                    }
                }
            }),
        )
        .await;
    }

    async fn execute<W: tokio::io::AsyncWrite + Unpin>(write: &mut W, id: i64, command: &str) {
        write_lsp_message(
            write,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "workspace/executeCommand",
                "params": { "command": command, "arguments": [] }
            }),
        )
        .await;
    }

    async fn gerrit_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/changes/1234/comments"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                ")]}'\n{\"src/a.ts\":[\
                 {\"patch_set\":2,\"line\":10,\"message\":\"fix\",\"author\":{\"name\":\"Bob\"}},\
                 {\"patch_set\":1,\"line\":3,\"message\":\"old\",\"author\":{\"name\":\"Bob\"}}]}",
            ))
            .mount(&server)
            .await;
        server
    }

    fn review_fixture() -> RepoFixture {
        let fixture = RepoFixture::new("src/a.ts", &"line\n".repeat(12));
        fixture.add_ref("refs/changes/34/1234/2");
        write_remote(fixture.root(), "origin", fixture.root());
        fixture
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lsp_end_to_end_load_highlight_hover_and_open() {
        let fixture = review_fixture();
        let server = gerrit_server().await;
        let Harness {
            mut read,
            mut write,
            server_task,
        } = start_server(&fixture, server.uri()).await;

        let file_uri = Url::from_file_path(fixture.root().join("src/a.ts")).expect("file uri");
        open_document(&mut write, &file_uri, &"line\n".repeat(12)).await;

        execute(&mut write, 2, COMMAND_LOAD_REVIEW).await;
        let loaded = wait_for_message(&mut read, |msg| is_method(msg, "window/showMessage")).await;
        assert_eq!(
            loaded["params"]["message"].as_str(),
            Some("Comments loaded for change 1234/2.")
        );

        let diagnostics_msg = wait_for_message(&mut read, |msg| {
            is_method(msg, "textDocument/publishDiagnostics")
        })
        .await;
        assert_eq!(
            diagnostics_msg["params"]["uri"].as_str(),
            Some(file_uri.as_str())
        );
        let diagnostics = diagnostics_msg["params"]["diagnostics"]
            .as_array()
            .expect("diagnostics array");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0]["message"].as_str(), Some("Bob: fix"));
        assert_eq!(diagnostics[0]["range"]["start"]["line"].as_u64(), Some(9));
        assert_eq!(diagnostics[0]["range"]["end"]["character"].as_u64(), Some(4));
        let _exec = wait_for_message(&mut read, |msg| msg.get("id") == Some(&2.into())).await;

        write_lsp_message(
            &mut write,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "textDocument/hover",
                "params": {
                    "textDocument": { "uri": file_uri },
                    "position": { "line": 9, "character": 1 }
                }
            }),
        )
        .await;
        let hover_msg = wait_for_message(&mut read, |msg| msg.get("id") == Some(&3.into())).await;
        assert_eq!(
            hover_msg["result"]["contents"]["value"].as_str(),
            Some("Bob: fix")
        );

        execute(&mut write, 4, COMMAND_GO_TO_COMMENT).await;
        let show = wait_for_message(&mut read, |msg| is_method(msg, "window/showDocument")).await;
        let uri = show["params"]["uri"].as_str().expect("uri");
        assert!(uri.ends_with("src/a.ts"), "{uri}");
        write_lsp_message(
            &mut write,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": show["id"].clone(),
                "result": { "success": true }
            }),
        )
        .await;
        let _exec = wait_for_message(&mut read, |msg| msg.get("id") == Some(&4.into())).await;

        server_task.abort();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lsp_asks_which_remote_through_message_request() {
        let fixture = review_fixture();
        write_remote(fixture.root(), "upstream", fixture.root());
        let server = gerrit_server().await;
        let Harness {
            mut read,
            mut write,
            server_task,
        } = start_server(&fixture, server.uri()).await;

        let file_uri = Url::from_file_path(fixture.root().join("src/a.ts")).expect("file uri");
        open_document(&mut write, &file_uri, &"line\n".repeat(12)).await;
        execute(&mut write, 2, COMMAND_LOAD_REVIEW).await;

        let request = wait_for_message(&mut read, |msg| {
            is_method(msg, "window/showMessageRequest")
        })
        .await;
        let mut titles: Vec<String> = request["params"]["actions"]
            .as_array()
            .expect("actions")
            .iter()
            .filter_map(|a| a["title"].as_str().map(str::to_string))
            .collect();
        titles.sort();
        assert_eq!(titles, vec!["origin".to_string(), "upstream".to_string()]);

        write_lsp_message(
            &mut write,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": request["id"].clone(),
                "result": { "title": "upstream" }
            }),
        )
        .await;

        let diagnostics_msg = wait_for_message(&mut read, |msg| {
            is_method(msg, "textDocument/publishDiagnostics")
        })
        .await;
        let diagnostics = diagnostics_msg["params"]["diagnostics"]
            .as_array()
            .expect("diagnostics array");
        assert_eq!(diagnostics.len(), 1);

        server_task.abort();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lsp_reports_load_failures() {
        let fixture = RepoFixture::new("src/a.ts", "x\n");
        write_remote(fixture.root(), "origin", fixture.root());
        let server = gerrit_server().await;
        let Harness {
            mut read,
            mut write,
            server_task,
        } = start_server(&fixture, server.uri()).await;

        execute(&mut write, 2, COMMAND_LOAD_REVIEW).await;
        let error = wait_for_message(&mut read, |msg| {
            is_method(msg, "window/showMessage") && msg["params"]["type"].as_u64() == Some(1)
        })
        .await;
        let message = error["params"]["message"].as_str().expect("message");
        assert!(
            message.starts_with("Unable to load code review: no change found for commit"),
            "{message}"
        );

        server_task.abort();
    }
}
