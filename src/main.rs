use anyhow::{Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use siem_query::ast::QueryParts;
use siem_query::sql::SqlCompiler;
use siem_query::{run_query, CancellationFlag, EngineConfig, MockProvider, QueryAst, QueryError, Schema};
use std::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const DEFAULT_CONFIG: &str = "siem_query.json";

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// 显式指定的路径必须加载成功；默认路径加载失败时退回内置配置
fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path)),
        None => match EngineConfig::from_json_file(DEFAULT_CONFIG) {
            Ok(config) => {
                info!(path = DEFAULT_CONFIG, "loaded config");
                Ok(config)
            }
            Err(err) => {
                warn!(error = %err, "using built-in configuration");
                Ok(EngineConfig::default())
            }
        },
    }
}

/// 解析一条查询文档，缺少 query_id 时自动生成
fn parse_query(line: &str) -> Result<QueryAst> {
    let mut parts: QueryParts = serde_json::from_str(line).context("parsing query document")?;
    if parts.query_id.trim().is_empty() {
        parts.query_id = Ulid::new().to_string();
    }
    Ok(QueryAst::from_parts(parts)?)
}

fn handle_query(line: &str, provider: &MockProvider, schema: &Schema, compiler: Option<&SqlCompiler>) -> Result<()> {
    let ast = parse_query(line)?;
    if let Some(compiler) = compiler {
        match compiler.compile(&ast, &schema.functions) {
            Ok(compiled) => println!("-- {}\n-- params: {:?}", compiled.sql, compiled.values),
            Err(err) => println!("-- no SQL form: {}", err),
        }
    }
    match run_query(provider, &ast, schema, &CancellationFlag::new()) {
        Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        Err(QueryError::Rejected(failures)) => {
            println!("rejected ({} failures):", failures.len());
            for failure in &failures {
                println!("  {}", failure);
            }
        }
        Err(QueryError::Execution(err)) => println!("failed [{}]: {}", err.code(), err),
    }
    Ok(())
}

fn main() -> Result<()> {
    install_tracing_subscriber();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(args.first().map(String::as_str))?;
    let schema = config.schema();

    let mut provider = MockProvider::new(config.mock.clone());
    if let Some(events_path) = args.get(1) {
        let content = fs::read_to_string(events_path)
            .with_context(|| format!("reading events {}", events_path))?;
        let loaded = provider
            .load_json(&content)
            .with_context(|| format!("parsing events {}", events_path))?;
        info!(events = loaded, path = %events_path, "loaded events");
    }

    let compiler = SqlCompiler::new(config.sql.clone());
    let mut show_sql = false;

    println!("siem_query console: one JSON query per line; :sql toggles SQL output, :quit exits");
    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("query> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                editor.add_history_entry(line)?;
                match line {
                    ":quit" | ":q" => break,
                    ":sql" => {
                        show_sql = !show_sql;
                        println!("sql output {}", if show_sql { "on" } else { "off" });
                    }
                    _ => {
                        let compiler = show_sql.then_some(&compiler);
                        if let Err(err) = handle_query(line, &provider, &schema, compiler) {
                            println!("error: {:#}", err);
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
