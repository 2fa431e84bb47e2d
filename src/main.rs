use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use deep_reader_analysis::cache::value::MindMapNode;
use deep_reader_analysis::pipeline::{GroupArtifact, Progress};
use deep_reader_analysis::source::source_for_path;
use deep_reader_analysis::stage::StagePartial;
use deep_reader_analysis::{
    group_chapters, AnalysisConfig, ArtifactKind, BookIdentity, CacheManager, ChapterGroup, ConfigHandle,
    OpenAiCompatibleProvider, Orchestrator, PipelineObserver, PipelineOutput, PipelineRequest, PipelineState,
    ProcessingMode, RunHandle, RunOutcome, SqliteArtifactStore, TagAssignment,
};

#[derive(Parser, Debug)]
#[command(name = "deep-reader-analysis")]
#[command(about = "书籍分析：章节摘要、章节关联、人物关系与思维导图", long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 缓存数据库路径，覆盖配置文件
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 分析一本书
    Run(RunArgs),

    /// 查看章节分组
    Groups {
        file: PathBuf,

        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// 缓存管理
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// 源文件（.txt / .md，或章节数组 .json）
    file: PathBuf,

    /// summary | chapter-mindmap | whole-book-mindmap
    #[arg(long, default_value = "summary")]
    mode: ProcessingMode,

    /// 章节标签，格式 ID=TAG，可重复
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,

    /// 只分析这些章节，可重复
    #[arg(long = "select")]
    selected: Vec<String>,

    /// 书名，默认取文件名
    #[arg(long)]
    title: Option<String>,

    /// 把标签和章节选择保存为该书的偏好
    #[arg(long)]
    save: bool,

    /// 以 JSON 输出结果
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// 按书籍列出缓存条目
    List,
    /// 缓存统计
    Stats,
    /// 清除缓存；不带选项时清除该书全部条目
    Clear {
        /// 书籍标识
        book: String,

        #[arg(long, conflicts_with = "mode")]
        kind: Option<ArtifactKind>,

        #[arg(long)]
        mode: Option<ProcessingMode>,

        /// 章节/分组 id，需配合 --kind
        #[arg(long, requires = "kind")]
        entity: Option<String>,
    },
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((id, tag)) if !id.trim().is_empty() => Ok((id.trim().to_string(), tag.trim().to_string())),
        _ => Err(format!("标签格式应为 ID=TAG: {}", raw)),
    }
}

/// 命令行观察者：进度写到 stderr
struct ConsoleObserver;

impl PipelineObserver for ConsoleObserver {
    fn on_state(&self, state: &PipelineState) {
        eprintln!("==> {}", state);
    }

    fn on_progress(&self, progress: Progress) {
        eprintln!("    进度 {}/{} ({:.0}%)", progress.completed, progress.total, progress.fraction() * 100.0);
    }

    fn on_group_resolved(&self, _index: usize, group: &ChapterGroup, _artifact: &GroupArtifact) {
        eprintln!("    完成分组：{}", group.display_name());
    }

    fn on_partial(&self, partial: &StagePartial) {
        if partial.from_cache {
            eprintln!("    {} 命中缓存", partial.kind);
        } else if !partial.is_final {
            eprintln!("    {} 已生成 {} 字", partial.kind, partial.content.chars().count());
        }
    }
}

fn open_store(config: &AnalysisConfig, database: Option<PathBuf>) -> Result<Arc<SqliteArtifactStore>> {
    let path = database.unwrap_or_else(|| config.storage.resolved_database_path());
    tracing::debug!(path = %path.display(), "打开缓存数据库");
    let store = SqliteArtifactStore::open(&path).with_context(|| format!("无法打开缓存数据库 {}", path.display()))?;
    Ok(Arc::new(store))
}

fn book_for(file: &Path, title: Option<String>) -> BookIdentity {
    let file_name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let book = BookIdentity::from_file_name(file_name);
    match title {
        Some(title) => book.with_title(title),
        None => book,
    }
}

fn merge_tags(saved: &TagAssignment, cli: Vec<(String, String)>) -> TagAssignment {
    let mut tags = saved.clone();
    tags.extend(cli);
    tags
}

fn print_node(node: &MindMapNode, depth: usize) {
    println!("{}- {}", "  ".repeat(depth), node.topic);
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

fn print_output(output: &PipelineOutput) {
    println!("# {}\n", output.book.title);
    for result in &output.groups {
        println!("## {}\n", result.group.display_name());
        match &result.artifact {
            GroupArtifact::Summary(text) => println!("{}\n", text),
            GroupArtifact::MindMap(map) => {
                print_node(&map.node_data, 0);
                println!();
            }
        }
    }

    let sections = [
        ("章节关联", &output.connections),
        ("人物关系", &output.character_relationship),
        ("全书总结", &output.overall_summary),
    ];
    for (name, text) in sections {
        if let Some(text) = text {
            println!("## {}\n\n{}\n", name, text);
        }
    }

    if let Some(map) = &output.mindmap {
        println!("## 思维导图\n");
        print_node(&map.node_data, 0);
        for arrow in &map.arrows {
            println!("  {} -> {}：{}", arrow.from, arrow.to, arrow.label);
        }
    }
}

async fn run_command(config: AnalysisConfig, store: Arc<SqliteArtifactStore>, args: RunArgs) -> Result<ExitCode> {
    let RunArgs {
        file,
        mode,
        tags,
        selected,
        title,
        save,
        json,
    } = args;
    let book = book_for(&file, title);
    let mut chapters = source_for_path(&file).extract_chapters(&file)?;

    let cache = CacheManager::new(store.clone());
    let mut preferences = cache.load_preferences(&book.token).await?;
    preferences.chapter_tags = merge_tags(&preferences.chapter_tags, tags);
    if !selected.is_empty() {
        preferences.selected_chapters = selected;
    }
    if save {
        cache.save_preferences(&book.token, &preferences).await?;
    }

    if !preferences.selected_chapters.is_empty() {
        chapters.retain(|c| preferences.selected_chapters.contains(&c.id));
    }
    if chapters.is_empty() {
        bail!("没有可分析的章节");
    }

    let handle = RunHandle::new();
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("收到中断信号，正在取消");
            signal_handle.cancel();
        }
    });

    let config = ConfigHandle::new(config);
    let provider = Arc::new(OpenAiCompatibleProvider::new(config.clone()));
    let orchestrator = Orchestrator::new(store, provider, config);
    let request = PipelineRequest {
        book,
        chapters,
        tags: preferences.chapter_tags,
        mode,
    };

    match orchestrator.run(&request, &ConsoleObserver, &handle).await {
        RunOutcome::Completed(output) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print_output(&output);
            }
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Aborted { stage } => {
            eprintln!("已取消（{}），已完成的阶段保留在缓存中", stage);
            Ok(ExitCode::from(130))
        }
        RunOutcome::Failed(failed) => {
            bail!("{} 阶段失败: {}", failed.stage, failed.error)
        }
    }
}

async fn groups_command(
    store: Arc<SqliteArtifactStore>,
    file: PathBuf,
    tags: Vec<(String, String)>,
) -> Result<ExitCode> {
    let book = book_for(&file, None);
    let chapters = source_for_path(&file).extract_chapters(&file)?;
    let preferences = CacheManager::new(store).load_preferences(&book.token).await?;
    let tags = merge_tags(&preferences.chapter_tags, tags);

    for (index, group) in group_chapters(&chapters, &tags).iter().enumerate() {
        println!(
            "{}\t{}\t{}\t{}",
            index,
            group.group_id,
            group.tag.as_deref().unwrap_or("-"),
            group.chapter_titles.join(" / ")
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cache_command(store: Arc<SqliteArtifactStore>, action: CacheCommand) -> Result<ExitCode> {
    let cache = CacheManager::new(store.clone());
    match action {
        CacheCommand::List => {
            for (book, entries) in cache.list_cache_by_book().await? {
                println!("{} ({})", book, entries.len());
                for entry in entries {
                    let updated = store
                        .updated_at(&entry.key)
                        .await?
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    let shape = entry.shape.map(|s| s.to_string()).unwrap_or_else(|| "?".to_string());
                    println!("  {}\t{}\t{}", entry.key, shape, updated);
                }
            }
        }
        CacheCommand::Stats => {
            let stats = cache.stats().await?;
            println!("书籍: {}", stats.books);
            println!("条目: {}", stats.entries);
            if stats.foreign_keys > 0 {
                println!("无法识别的键: {}", stats.foreign_keys);
            }
            for (kind, count) in stats.by_kind {
                println!("  {}\t{}", kind, count);
            }
        }
        CacheCommand::Clear {
            book,
            kind,
            mode,
            entity,
        } => {
            let removed = match (kind, mode, entity) {
                (Some(kind), _, Some(entity)) => usize::from(cache.clear_chapter_cache(&book, &entity, kind).await?),
                (Some(kind), _, None) => cache.clear_by_kind(&book, kind).await?,
                (None, Some(mode), _) => cache.clear_by_book_and_mode(&book, mode).await?,
                (None, None, _) => cache.clear_all_for_book(&book).await?,
            };
            println!("已删除 {} 条", removed);
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(AnalysisConfig::default_path);
    let config = AnalysisConfig::load(&config_path)?;
    let store = open_store(&config, cli.database)?;

    match cli.command {
        Commands::Run(args) => run_command(config, store, args).await,
        Commands::Groups { file, tags } => groups_command(store, file, tags).await,
        Commands::Cache { action } => cache_command(store, action).await,
    }
}
