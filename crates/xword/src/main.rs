use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use xword_core::client::{Attachment, Page, XWikiClient, XWikiClientConfig, XWikiProxy};
use xword_core::config::{XWordConfig, credentials_from_env, load_config};
use xword_core::html::{CleanMode, clean_html, indent_content};
use xword_core::structure::WikiStructure;
use xword_core::sync::{SyncReport, fetch_structure, publish_document, refresh_space};
use xword_core::xmlrpc::Fault;

#[derive(Debug, Parser)]
#[command(
    name = "xword",
    version,
    about = "Browse, edit, and publish pages of a remote XWiki over XML-RPC"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Config file (default: ./xword.toml)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "List the spaces of the wiki")]
    Spaces,
    #[command(about = "List page summaries for a space")]
    Pages(PagesArgs),
    #[command(about = "Fetch the full space/page structure and print it")]
    Tree,
    #[command(about = "Fetch a full page record, including content")]
    Fetch(FetchArgs),
    #[command(about = "Publish local content to a page")]
    Publish(PublishArgs),
    #[command(about = "Remove a page from the remote wiki")]
    Remove(RemoveArgs),
    #[command(about = "Show the revision history of a page")]
    History(HistoryArgs),
    #[command(about = "List pages modified since a date")]
    Changes(ChangesArgs),
    #[command(subcommand, about = "Attachment operations")]
    Attachment(AttachmentCommand),
    #[command(about = "Clean an HTML file locally")]
    Clean(CleanArgs),
}

#[derive(Debug, Args)]
struct PagesArgs {
    #[arg(value_name = "SPACE")]
    space: String,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[arg(value_name = "PAGE_ID", help = "Page id, e.g. Main.WebHome")]
    page_id: String,
    #[arg(long, value_name = "PATH", help = "Write page content to a file")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[arg(value_name = "PAGE_ID", help = "Page id, e.g. Main.WebHome")]
    page_id: String,
    #[arg(long, value_name = "PATH", help = "File holding the new content")]
    file: PathBuf,
    #[arg(long, value_name = "TITLE", help = "Title for a newly created page")]
    title: Option<String>,
    #[arg(long, help = "Fail instead of overwriting an existing page")]
    check_version: bool,
    #[arg(long, help = "Run Word-origin HTML cleanup on the content first")]
    clean_word_html: bool,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    #[arg(value_name = "PAGE_ID")]
    page_id: String,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(value_name = "PAGE_ID")]
    page_id: String,
}

#[derive(Debug, Args)]
struct ChangesArgs {
    #[arg(long, value_name = "DATE", help = "ISO8601 date, e.g. 20240101T00:00:00")]
    since: String,
    #[arg(long, default_value_t = 25, help = "Maximum number of entries")]
    max: i32,
}

#[derive(Debug, Subcommand)]
enum AttachmentCommand {
    #[command(about = "List attachments of a page")]
    List(AttachmentListArgs),
    #[command(about = "Upload a file as an attachment")]
    Add(AttachmentAddArgs),
    #[command(about = "Download an attachment")]
    Get(AttachmentGetArgs),
    #[command(about = "Remove an attachment")]
    Remove(AttachmentRemoveArgs),
}

#[derive(Debug, Args)]
struct AttachmentListArgs {
    #[arg(value_name = "PAGE_ID")]
    page_id: String,
}

#[derive(Debug, Args)]
struct AttachmentAddArgs {
    #[arg(value_name = "PAGE_ID")]
    page_id: String,
    #[arg(value_name = "FILE")]
    file: PathBuf,
    #[arg(long, value_name = "TYPE", default_value = "application/octet-stream")]
    content_type: String,
}

#[derive(Debug, Args)]
struct AttachmentGetArgs {
    #[arg(value_name = "PAGE_ID")]
    page_id: String,
    #[arg(value_name = "NAME")]
    name: String,
    #[arg(long, value_name = "VERSION", default_value = "0")]
    version: String,
    #[arg(long, value_name = "PATH", help = "Write to a file instead of stdout")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AttachmentRemoveArgs {
    #[arg(value_name = "PAGE_ID")]
    page_id: String,
    #[arg(value_name = "NAME")]
    name: String,
}

#[derive(Debug, Args)]
struct CleanArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
    #[arg(long, help = "Apply Word-origin cleanup instead of the general pass")]
    word: bool,
    #[arg(long, help = "Indent the cleaned markup")]
    indent: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;

    match cli.command {
        Commands::Spaces => run_spaces(&config),
        Commands::Pages(args) => run_pages(&config, &args),
        Commands::Tree => run_tree(&config),
        Commands::Fetch(args) => run_fetch(&config, &args),
        Commands::Publish(args) => run_publish(&config, &args),
        Commands::Remove(args) => run_remove(&config, &args),
        Commands::History(args) => run_history(&config, &args),
        Commands::Changes(args) => run_changes(&config, &args),
        Commands::Attachment(command) => run_attachment(&config, &command),
        Commands::Clean(args) => run_clean(&args),
    }
}

fn load_runtime_config(cli: &Cli) -> Result<XWordConfig> {
    dotenvy::dotenv().ok();
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("xword.toml"));
    load_config(&path)
}

fn connect(config: &XWordConfig) -> Result<(XWikiClient, String)> {
    let mut client = XWikiClient::new(XWikiClientConfig::from_config(config))?;
    let Some((username, password)) = credentials_from_env() else {
        bail!("missing credentials: set XWIKI_USER and XWIKI_PASSWORD");
    };
    let token = client
        .login(&username, &password)
        .context("login failed")?;
    Ok((client, token))
}

fn run_spaces(config: &XWordConfig) -> Result<()> {
    let (mut client, token) = connect(config)?;
    let spaces = client.get_spaces(&token)?;
    for space in &spaces {
        println!("{}\t{}", space.key, space.name);
    }
    println!("total: {} spaces ({} requests)", spaces.len(), client.request_count());
    Ok(())
}

fn run_pages(config: &XWordConfig, args: &PagesArgs) -> Result<()> {
    let (mut client, token) = connect(config)?;
    let pages = client.get_pages(&token, &args.space)?;
    for page in &pages {
        println!("{}\t{}", page.id, page.title);
    }
    println!("total: {} pages ({} requests)", pages.len(), client.request_count());
    Ok(())
}

fn run_tree(config: &XWordConfig) -> Result<()> {
    let (mut client, token) = connect(config)?;
    let mut structure = fetch_structure(&mut client, &token)?;
    let space_keys = structure
        .spaces
        .iter()
        .map(|space| space.name.clone())
        .collect::<Vec<_>>();
    for key in &space_keys {
        refresh_space(&mut client, &token, &mut structure, key)?;
    }

    for space in &structure.spaces {
        println!("{}", space.name);
        for document in &space.documents {
            println!("  {} ({})", document.name, document.id);
        }
    }
    let report = SyncReport::for_structure(&structure, client.request_count());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_fetch(config: &XWordConfig, args: &FetchArgs) -> Result<()> {
    let (mut client, token) = connect(config)?;
    let page = client.get_page(&token, &args.page_id)?;
    match &args.output {
        Some(path) => {
            fs::write(path, &page.content)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {} bytes to {}", page.content.len(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&page)?),
    }
    Ok(())
}

fn run_publish(config: &XWordConfig, args: &PublishArgs) -> Result<()> {
    let mut content = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    if args.clean_word_html {
        content = clean_html(&content, CleanMode::WordOrigin);
    }

    let (mut client, token) = connect(config)?;
    let mut structure = WikiStructure::new();
    let fetched = client.get_page(&token, &args.page_id);
    let (page, fetch_fault) =
        resolve_publish_target(fetched, &args.page_id, args.title.as_deref(), content)?;
    if let Some(fault) = &fetch_fault {
        println!(
            "{}: not fetched ({fault}); publishing as a new page",
            args.page_id
        );
    }

    let stored = publish_document(&mut client, &token, &mut structure, &page, args.check_version)?;
    println!(
        "stored {} (version {}, {} requests)",
        stored.id,
        stored
            .version
            .map(|version| version.to_string())
            .unwrap_or_else(|| "?".to_string()),
        client.request_count()
    );
    Ok(())
}

fn run_remove(config: &XWordConfig, args: &RemoveArgs) -> Result<()> {
    let (mut client, token) = connect(config)?;
    let removed = client.remove_page(&token, &args.page_id)?;
    println!(
        "{}: {}",
        args.page_id,
        if removed { "removed" } else { "not removed" }
    );
    Ok(())
}

fn run_history(config: &XWordConfig, args: &HistoryArgs) -> Result<()> {
    let (mut client, token) = connect(config)?;
    let history = client.get_page_history(&token, &args.page_id)?;
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

fn run_changes(config: &XWordConfig, args: &ChangesArgs) -> Result<()> {
    let (mut client, token) = connect(config)?;
    let history = client.get_modified_pages_history(&token, &args.since, args.max)?;
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

fn run_attachment(config: &XWordConfig, command: &AttachmentCommand) -> Result<()> {
    let (mut client, token) = connect(config)?;
    match command {
        AttachmentCommand::List(args) => {
            let attachments = client.get_attachments(&token, &args.page_id)?;
            println!("{}", serde_json::to_string_pretty(&attachments)?);
        }
        AttachmentCommand::Add(args) => {
            let data = fs::read(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let file_name = args
                .file
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .ok_or_else(|| anyhow::anyhow!("attachment path has no file name"))?;
            let attachment = Attachment {
                page_id: args.page_id.clone(),
                file_name,
                content_type: args.content_type.clone(),
                ..Attachment::default()
            };
            let stored = client.add_attachment(&token, 0, &attachment, &data)?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        AttachmentCommand::Get(args) => {
            let data =
                client.get_attachment_data(&token, &args.page_id, &args.name, &args.version)?;
            match &args.output {
                Some(path) => {
                    fs::write(path, &data)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("wrote {} bytes to {}", data.len(), path.display());
                }
                None => println!("{} bytes", data.len()),
            }
        }
        AttachmentCommand::Remove(args) => {
            let removed = client.remove_attachment(&token, &args.page_id, &args.name)?;
            println!(
                "{}/{}: {}",
                args.page_id,
                args.name,
                if removed { "removed" } else { "not removed" }
            );
        }
    }
    Ok(())
}

fn run_clean(args: &CleanArgs) -> Result<()> {
    let source = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let mode = if args.word {
        CleanMode::WordOrigin
    } else {
        CleanMode::General
    };
    let mut cleaned = clean_html(&source, mode);
    if args.indent {
        cleaned = indent_content(&cleaned);
    }
    print!("{cleaned}");
    Ok(())
}

/// Decides what a publish sends: an edit of the fetched page, or a fresh page
/// when the fetch came back as a server fault. The fault is handed back so the
/// caller can tell the user why the publish creates instead of edits; transport
/// errors propagate untouched.
fn resolve_publish_target(
    fetched: Result<Page>,
    page_id: &str,
    title: Option<&str>,
    content: String,
) -> Result<(Page, Option<Fault>)> {
    match fetched {
        Ok(existing) => {
            let title = title
                .map(ToString::to_string)
                .unwrap_or_else(|| existing.title.clone());
            Ok((
                Page {
                    content,
                    title,
                    ..existing
                },
                None,
            ))
        }
        Err(error) => match error.downcast_ref::<Fault>() {
            Some(fault) => {
                let fault = fault.clone();
                Ok((new_page_from_id(page_id, title, content)?, Some(fault)))
            }
            None => Err(error),
        },
    }
}

fn new_page_from_id(page_id: &str, title: Option<&str>, content: String) -> Result<Page> {
    let Some((space, name)) = page_id.split_once('.') else {
        bail!("page id must take the Space.PageName form: {page_id}");
    };
    if space.is_empty() || name.is_empty() {
        bail!("page id must take the Space.PageName form: {page_id}");
    }
    Ok(Page {
        id: page_id.to_string(),
        space: space.to_string(),
        title: title.unwrap_or(name).to_string(),
        content,
        ..Page::default()
    })
}
