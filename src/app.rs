use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::config::APP_NAME;
use crate::models::{Attachment, AuthOutcome, Session};
use crate::providers::{CompletionService, HostedAuthProvider};
use crate::services::auth_guard::{AuthError, CaptchaPolicy, CAPTCHA_THRESHOLD};
use crate::services::conversation::ConversationError;
use crate::services::keyring::AUTH_REFRESH_TOKEN;
use crate::services::{
    AuthGuard, AuthRequest, ConversationManager, Database, KeyringService, SessionTracker,
    SettingsService,
};

const HELP: &str = "\
Antes de entrar:
  /login <email> <senha>
  /signup <email> <senha> <confirmação>
  /captcha <token> | clear
Depois de entrar:
  /new [título]        nova conversa
  /list                listar conversas
  /open <n>            abrir conversa
  /close               fechar a conversa aberta
  /rename <n> <título> renomear conversa
  /delete <n>          excluir conversa
  /export <n> <arquivo> exportar em Markdown
  /attach <arquivo>    anexar arquivo à próxima mensagem
  /logout
Sempre:
  /captcha-policy always | after [n]
  /help, /quit
Qualquer outro texto é enviado como mensagem.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SignIn { email: String, password: String },
    SignUp { email: String, password: String, confirm: String },
    Captcha(String),
    ClearCaptcha,
    CaptchaPolicy(CaptchaPolicy),
    New(Option<String>),
    List,
    Open(usize),
    Close,
    Rename(usize, String),
    Delete(usize),
    Export(usize, PathBuf),
    Attach(PathBuf),
    Logout,
    Help,
    Quit,
    Say(String),
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };

    let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let args = args.trim();
    let words: Vec<&str> = args.split_whitespace().collect();
    let index = |s: Option<&&str>| s.and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0);
    let usage = |text: &str| Command::Invalid(format!("Uso: {}", text));

    match name {
        "login" => match words.as_slice() {
            [email, password] => Command::SignIn {
                email: email.to_string(),
                password: password.to_string(),
            },
            _ => usage("/login <email> <senha>"),
        },
        "signup" => match words.as_slice() {
            [email, password, confirm] => Command::SignUp {
                email: email.to_string(),
                password: password.to_string(),
                confirm: confirm.to_string(),
            },
            _ => usage("/signup <email> <senha> <confirmação>"),
        },
        "captcha" if args == "clear" => Command::ClearCaptcha,
        "captcha" if !args.is_empty() => Command::Captcha(args.to_string()),
        "captcha" => usage("/captcha <token>"),
        "captcha-policy" => match words.as_slice() {
            ["always"] => Command::CaptchaPolicy(CaptchaPolicy::Always),
            ["after"] => Command::CaptchaPolicy(CaptchaPolicy::AfterFailures(CAPTCHA_THRESHOLD)),
            ["after", n] => match n.parse::<u32>() {
                Ok(n) => Command::CaptchaPolicy(CaptchaPolicy::AfterFailures(n)),
                Err(_) => usage("/captcha-policy always | after [n]"),
            },
            _ => usage("/captcha-policy always | after [n]"),
        },
        "new" => Command::New(Some(args.to_string()).filter(|t| !t.is_empty())),
        "list" => Command::List,
        "open" => index(words.first()).map(Command::Open).unwrap_or_else(|| usage("/open <n>")),
        "close" => Command::Close,
        "rename" => match (index(words.first()), args.split_once(char::is_whitespace)) {
            (Some(n), Some((_, title))) if !title.trim().is_empty() => {
                Command::Rename(n, title.trim().to_string())
            }
            _ => usage("/rename <n> <título>"),
        },
        "delete" => index(words.first()).map(Command::Delete).unwrap_or_else(|| usage("/delete <n>")),
        "export" => match (index(words.first()), words.get(1)) {
            (Some(n), Some(path)) => Command::Export(n, PathBuf::from(path)),
            _ => usage("/export <n> <arquivo>"),
        },
        "attach" if !args.is_empty() => Command::Attach(PathBuf::from(args)),
        "attach" => usage("/attach <arquivo>"),
        "logout" => Command::Logout,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Invalid(format!("Comando desconhecido: /{}", other)),
    }
}

pub struct App {
    db: Database,
    keyring: Option<KeyringService>,
    auth: Arc<HostedAuthProvider>,
    completion: Arc<dyn CompletionService>,
    guard: AuthGuard,
    tracker: SessionTracker,
    session_updates: watch::Receiver<Option<Session>>,
    manager: Option<ConversationManager>,
    pending_attachments: Vec<Attachment>,
    stored_refresh_token: Option<String>,
}

impl App {
    pub fn new(
        db: Database,
        keyring: Option<KeyringService>,
        auth: Arc<HostedAuthProvider>,
        completion: Arc<dyn CompletionService>,
        guard: AuthGuard,
        tracker: SessionTracker,
    ) -> Self {
        Self {
            db,
            keyring,
            auth,
            completion,
            guard,
            session_updates: tracker.subscribe(),
            tracker,
            manager: None,
            pending_attachments: Vec::new(),
            stored_refresh_token: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        println!("{}: digite /help para ver os comandos.", APP_NAME);
        self.restore_session().await;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            self.sync_session().await;
            if self.guard.captcha_required() && self.manager.is_none() {
                println!("(CAPTCHA necessário: /captcha <token>)");
            }

            let Some(line) = lines.next_line().await.context("Failed to read input")? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            if self.manager.is_some() {
                self.refresh_session_if_expiring().await;
            }

            if !self.handle(parse_command(&line)).await {
                break;
            }
        }

        self.tracker.shutdown();
        tracing::info!("Session ended");
        Ok(())
    }

    /// Returns `false` when the user asked to quit.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Quit => return false,
            Command::Help => println!("{}", HELP),
            Command::Invalid(message) => println!("{}", message),
            Command::Captcha(token) => {
                self.guard.set_captcha_token(token);
                println!("CAPTCHA registrado.");
            }
            Command::ClearCaptcha => {
                self.guard.clear_captcha_token();
                println!("CAPTCHA descartado.");
            }
            Command::CaptchaPolicy(captcha) => self.set_captcha_policy(captcha).await,
            Command::SignIn { email, password } => {
                self.authenticate(AuthRequest::sign_in(email, password)).await
            }
            Command::SignUp {
                email,
                password,
                confirm,
            } => {
                self.authenticate(AuthRequest::sign_up(email, password, confirm))
                    .await
            }
            command => match self.manager.take() {
                Some(manager) => {
                    let keep = self.handle_signed_in(&manager, command).await;
                    if keep {
                        self.manager = Some(manager);
                    }
                }
                None => println!("Entre com /login ou crie uma conta com /signup."),
            },
        }
        true
    }

    /// Returns `false` once the session has ended.
    async fn handle_signed_in(&mut self, manager: &ConversationManager, command: Command) -> bool {
        let result = match command {
            Command::New(title) => manager
                .create_conversation(title.as_deref())
                .await
                .map(|c| println!("Conversa criada: {}", c.title)),
            Command::List => manager.list_conversations().await.map(|_| print_list(manager)),
            Command::Open(n) => match conversation_id(manager, n) {
                Some(id) => manager.select_conversation(Some(&id)).await.map(|_| print_messages(manager)),
                None => missing(n),
            },
            Command::Close => manager.select_conversation(None).await,
            Command::Rename(n, title) => match conversation_id(manager, n) {
                Some(id) => manager.rename_conversation(&id, &title).await,
                None => missing(n),
            },
            Command::Delete(n) => match conversation_id(manager, n) {
                Some(id) => manager
                    .delete_conversation(&id)
                    .await
                    .map(|_| println!("Conversa excluída.")),
                None => missing(n),
            },
            Command::Export(n, path) => match conversation_id(manager, n) {
                Some(id) => match manager.export_markdown(&id).await {
                    Ok(markdown) => write_export(&path, &markdown).await.map_err(ConversationError::from),
                    Err(e) => Err(e),
                },
                None => missing(n),
            },
            Command::Attach(path) => match read_attachment(&path).await {
                Ok(attachment) => {
                    println!("Anexado: {} ({} bytes)", attachment.filename, attachment.size());
                    self.pending_attachments.push(attachment);
                    Ok(())
                }
                Err(e) => {
                    println!("Não foi possível anexar: {:#}", e);
                    Ok(())
                }
            },
            Command::Say(text) => {
                let attachments = std::mem::take(&mut self.pending_attachments);
                match manager.send_message(&text, None, &attachments).await {
                    Ok(exchange) => {
                        println!("\n{}: {}\n", APP_NAME, exchange.assistant_message.content);
                        Ok(())
                    }
                    Err(e) => {
                        self.pending_attachments = attachments;
                        Err(e)
                    }
                }
            }
            Command::Logout => {
                if let Err(e) = self.guard.sign_out().await {
                    println!("{}", e.user_message());
                }
                self.forget_refresh_token().await;
                println!("Você saiu.");
                return false;
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            tracing::error!("{:#}", e);
            println!("Erro: {}", e);
        }
        true
    }

    async fn authenticate(&mut self, request: AuthRequest) {
        if self.manager.is_some() {
            println!("Você já está conectado. Use /logout primeiro.");
            return;
        }

        match self.guard.submit(&request).await {
            Ok(AuthOutcome::SignedIn(session)) => self.start_session(session).await,
            Ok(AuthOutcome::ConfirmationPending { email }) => {
                println!("Conta criada. Confirme o e-mail enviado para {} e depois entre.", email)
            }
            Err(AuthError::Locked { remaining_minutes }) => {
                println!("Muitas tentativas. Tente novamente em {} minuto(s).", remaining_minutes)
            }
            Err(e) => println!("{}", e.user_message()),
        }
    }

    async fn start_session(&mut self, session: Session) {
        println!("Bem-vindo(a), {}!", session.email);
        self.remember_refresh_token(&session).await;

        let manager = ConversationManager::new(session, Arc::new(self.db.clone()), self.completion.clone());
        match manager.list_conversations().await {
            Ok(_) => print_list(&manager),
            Err(e) => println!("Não foi possível carregar as conversas: {}", e),
        }
        self.manager = Some(manager);
    }

    async fn set_captcha_policy(&mut self, captcha: CaptchaPolicy) {
        let mut settings = SettingsService::load(&self.db).await;
        settings.captcha_policy = captcha;
        if let Err(e) = SettingsService::save(&self.db, &settings).await {
            tracing::error!("Failed to save settings: {:#}", e);
            println!("Não foi possível salvar a configuração.");
            return;
        }

        self.guard.set_captcha_policy(captcha);
        match self.guard.policy().captcha {
            CaptchaPolicy::Always => println!("CAPTCHA exigido em todas as tentativas."),
            CaptchaPolicy::AfterFailures(n) => {
                println!("CAPTCHA exigido após {} tentativa(s) sem sucesso.", n)
            }
        }
    }

    async fn refresh_session_if_expiring(&mut self) {
        match self.tracker.refresh_if_expiring(Utc::now()).await {
            Ok(Some(session)) => self.remember_refresh_token(&session).await,
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to refresh session: {}", e),
        }
    }

    async fn restore_session(&mut self) {
        let Some(keyring) = &self.keyring else {
            return;
        };
        let token = match keyring.retrieve(AUTH_REFRESH_TOKEN).await {
            Ok(Some(token)) => token,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Failed to read stored session: {:#}", e);
                return;
            }
        };

        match self.auth.restore_session(&token).await {
            Ok(session) => self.start_session(session).await,
            Err(e) => {
                tracing::info!("Stored session rejected: {}", e);
                self.forget_refresh_token().await;
            }
        }
    }

    /// Drop the manager when the session ends elsewhere and persist rotated
    /// refresh tokens.
    async fn sync_session(&mut self) {
        if !self.session_updates.has_changed().unwrap_or(false) {
            return;
        }
        let current = self.session_updates.borrow_and_update().clone();
        match current {
            None if self.manager.is_some() => {
                self.manager = None;
                self.pending_attachments.clear();
                println!("Sua sessão terminou. Entre novamente.");
            }
            Some(session) if self.manager.is_some() => {
                self.remember_refresh_token(&session).await;
            }
            _ => {}
        }
    }

    async fn remember_refresh_token(&mut self, session: &Session) {
        if self.stored_refresh_token.as_deref() == Some(session.refresh_token.as_str()) {
            return;
        }
        if let Some(keyring) = &self.keyring {
            if let Err(e) = keyring.store(AUTH_REFRESH_TOKEN, &session.refresh_token).await {
                tracing::warn!("Failed to store session: {:#}", e);
                return;
            }
        }
        self.stored_refresh_token = Some(session.refresh_token.clone());
    }

    async fn forget_refresh_token(&mut self) {
        self.stored_refresh_token = None;
        if let Some(keyring) = &self.keyring {
            if let Err(e) = keyring.delete(AUTH_REFRESH_TOKEN).await {
                tracing::warn!("Failed to clear stored session: {:#}", e);
            }
        }
    }
}

fn conversation_id(manager: &ConversationManager, n: usize) -> Option<String> {
    manager
        .view()
        .conversations
        .get(n.checked_sub(1)?)
        .map(|c| c.id.clone())
}

fn missing(n: usize) -> Result<(), ConversationError> {
    println!("Conversa {} não existe.", n);
    Ok(())
}

fn print_list(manager: &ConversationManager) {
    let view = manager.view();
    if view.conversations.is_empty() {
        println!("Nenhuma conversa ainda. Escreva algo para começar.");
        return;
    }
    for (i, conversation) in view.conversations.iter().enumerate() {
        let marker = if view.active_conversation_id.as_deref() == Some(conversation.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{}{:>3}. {} ({})",
            marker,
            i + 1,
            conversation.title,
            conversation.updated_at.format("%d/%m/%Y %H:%M")
        );
    }
}

fn print_messages(manager: &ConversationManager) {
    for message in manager.view().messages {
        println!("[{}] {}\n", message.role.as_str(), message.content);
    }
}

async fn read_attachment(path: &Path) -> Result<Attachment> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Path has no file name")?;
    // Kind detection falls back to the extension.
    Ok(Attachment::new(filename, "application/octet-stream", data))
}

async fn write_export(path: &Path, markdown: &str) -> Result<()> {
    tokio::fs::write(path, markdown)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Conversa exportada para {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::services::testing::FakeCompletion;
    use crate::services::{GuardPolicy, SystemClock};

    #[test]
    fn test_plain_text_is_sent() {
        assert_eq!(
            parse_command("  What is a jaguar?  "),
            Command::Say("What is a jaguar?".to_string())
        );
    }

    #[test]
    fn test_auth_commands() {
        assert_eq!(
            parse_command("/login ana@example.com segredo"),
            Command::SignIn {
                email: "ana@example.com".to_string(),
                password: "segredo".to_string(),
            }
        );
        assert!(matches!(parse_command("/login ana@example.com"), Command::Invalid(_)));
        assert!(matches!(
            parse_command("/signup a@b.co x y"),
            Command::SignUp { .. }
        ));
        assert_eq!(parse_command("/captcha tok-123"), Command::Captcha("tok-123".to_string()));
        assert_eq!(parse_command("/captcha clear"), Command::ClearCaptcha);
    }

    #[test]
    fn test_conversation_commands() {
        assert_eq!(parse_command("/new"), Command::New(None));
        assert_eq!(parse_command("/new Aves do Cerrado"), Command::New(Some("Aves do Cerrado".to_string())));
        assert_eq!(parse_command("/open 2"), Command::Open(2));
        assert_eq!(
            parse_command("/rename 1 Peixes da Amazônia"),
            Command::Rename(1, "Peixes da Amazônia".to_string())
        );
        assert_eq!(
            parse_command("/export 3 /tmp/conversa.md"),
            Command::Export(3, PathBuf::from("/tmp/conversa.md"))
        );
        assert_eq!(parse_command("/attach dados/censo.csv"), Command::Attach(PathBuf::from("dados/censo.csv")));
    }

    #[test]
    fn test_captcha_policy_command() {
        assert_eq!(
            parse_command("/captcha-policy always"),
            Command::CaptchaPolicy(CaptchaPolicy::Always)
        );
        assert_eq!(
            parse_command("/captcha-policy after"),
            Command::CaptchaPolicy(CaptchaPolicy::AfterFailures(3))
        );
        assert_eq!(
            parse_command("/captcha-policy after 5"),
            Command::CaptchaPolicy(CaptchaPolicy::AfterFailures(5))
        );
        assert!(matches!(parse_command("/captcha-policy sometimes"), Command::Invalid(_)));
    }

    #[tokio::test]
    async fn test_captcha_policy_is_saved_and_applied() {
        let db = Database::new_in_memory().unwrap();
        let auth = Arc::new(HostedAuthProvider::new(AuthConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            anon_key: "anon".to_string(),
        }));
        let guard = AuthGuard::new(auth.clone(), Arc::new(SystemClock), GuardPolicy::default());
        let tracker = SessionTracker::start(auth.clone()).await;
        let completion = Arc::new(FakeCompletion::replying("ok"));
        let mut app = App::new(db.clone(), None, auth, completion, guard, tracker);
        assert!(app.guard.captcha_required());

        let keep_going = app
            .handle(Command::CaptchaPolicy(CaptchaPolicy::AfterFailures(3)))
            .await;

        assert!(keep_going);
        assert_eq!(app.guard.policy().captcha, CaptchaPolicy::AfterFailures(3));
        assert!(!app.guard.captcha_required());

        app.handle(Command::Captcha("tok".to_string())).await;
        assert!(app.guard.state().captcha_token.is_some());
        app.handle(Command::ClearCaptcha).await;
        assert!(app.guard.state().captcha_token.is_none());

        assert_eq!(
            SettingsService::load(&db).await.captcha_policy,
            CaptchaPolicy::AfterFailures(3)
        );
    }

    #[test]
    fn test_bad_indexes_rejected() {
        assert!(matches!(parse_command("/open 0"), Command::Invalid(_)));
        assert!(matches!(parse_command("/delete abc"), Command::Invalid(_)));
        assert!(matches!(parse_command("/rename 1"), Command::Invalid(_)));
        assert!(matches!(parse_command("/unknown"), Command::Invalid(_)));
    }

    #[tokio::test]
    async fn test_read_attachment_keeps_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("censo.csv");
        std::fs::write(&path, "especie,total\n").unwrap();

        let attachment = read_attachment(&path).await.unwrap();
        assert_eq!(attachment.filename, "censo.csv");
        assert_eq!(attachment.data, b"especie,total\n");
    }
}
