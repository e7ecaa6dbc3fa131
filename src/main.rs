// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use legate_config::{config_path, data_dir, load_config, Config};
use legate_core::modes::agent::{run_agent, AgentOptions};
use legate_core::modes::converse::{run_converse, ConverseOptions};
use legate_core::modes::delegate::{run_delegate, DelegateOptions};
use legate_core::modes::multi::{preset_roles, MultiSession};
use legate_core::modes::plan::{run_plan, Plan};
use legate_core::modes::quantum::{run_quantum, QuantumOptions};
use legate_core::modes::ModeContext;
use legate_core::{
    chat_in_session, knowledge, Injection, InjectionKind, SessionCall, SessionStore,
};
use legate_model::api::{ApiOutcome, ApiTransport};
use legate_model::health::{detect_mode, CredentialMode, HealthProbe, SessionHealth};
use legate_model::pow::ensure_wasm_module;
use legate_model::ratelimit::RateLimiter;
use legate_model::web::WebTransport;
use legate_model::{classify_task, ChatBackend, ChatMessage, ToolSchema};
use legate_skills::{
    build_negotiate_prompt, load_requested_skills, parse_skill_response, SkillCatalog,
    NEGOTIATE_SYSTEM, NEGOTIATE_TIMEOUT_SECS,
};
use legate_tools::ToolRegistry;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn sessions_path() -> PathBuf {
    data_dir().join("sessions.json")
}

fn read_file_arg(path: &Option<String>, what: &str) -> anyhow::Result<Option<String>> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("{what}: {p}"))?;
            Ok(Some(text))
        }
        None => Ok(None),
    }
}

/// Build the web transport, fetching the PoW module on first use.
async fn build_web_transport(config: &Config) -> anyhow::Result<WebTransport> {
    let bearer = config.bearer_token.as_deref().context("missing bearer token")?;
    let cookies = config.cookies.as_deref().context("missing cookies")?;
    let wasm_path = config
        .wasm_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("pow_solver.wasm"));
    ensure_wasm_module(&reqwest::Client::new(), &wasm_path)
        .await
        .context("fetching pow solver module")?;
    Ok(WebTransport::new(bearer, cookies, &wasm_path, None)?)
}

struct WebProbe<'a>(&'a WebTransport);

#[async_trait::async_trait]
impl HealthProbe for WebProbe<'_> {
    async fn probe(&self) -> bool {
        self.0.probe().await.is_ok()
    }
}

/// Negotiate skills with the backend; transparently empty on any failure
/// so the heuristic scorer takes over.
async fn negotiate_skills(
    backend: &dyn ChatBackend,
    catalog: &SkillCatalog,
    task: &str,
    budget: usize,
) -> Vec<Injection> {
    let catalog_text = catalog.catalog_text();
    if catalog_text.is_empty() {
        return Vec::new();
    }
    let prompt = format!("{NEGOTIATE_SYSTEM}\n\n{}", build_negotiate_prompt(task, &catalog_text));
    let reply = match tokio::time::timeout(
        std::time::Duration::from_secs(NEGOTIATE_TIMEOUT_SECS),
        backend.chat(&prompt, false, None, 1),
    )
    .await
    {
        Ok(Ok(reply)) => reply,
        _ => {
            tracing::warn!("skill negotiation timed out, falling back to heuristic scoring");
            return Vec::new();
        }
    };
    let requested = parse_skill_response(&reply);
    if requested.is_empty() {
        tracing::info!("backend requested no skills");
        return Vec::new();
    }
    let context = load_requested_skills(catalog, &requested, budget);
    tracing::info!(
        requested = requested.len(),
        loaded = context.loaded.len(),
        tokens = context.tokens_used,
        "negotiated skills"
    );
    context
        .loaded
        .iter()
        .filter_map(|name| {
            catalog
                .get(name)
                .map(|s| Injection::new(InjectionKind::Skill, name.clone(), s.content.clone()))
        })
        .collect()
}

/// Drive a one-shot query over the direct API with native tool calling.
async fn run_api_query(config: &Config, query: &str, tools: &ToolRegistry) -> anyhow::Result<String> {
    let api_key = config.effective_api_key().context("no API key configured")?;
    let transport = ApiTransport::new(
        &api_key,
        &config.model,
        config.auto_select_model,
        config.max_tokens,
        None,
    );
    let level = classify_task(query, false);
    let schemas: Vec<ToolSchema> = tools
        .descriptors()
        .into_iter()
        .map(|d| ToolSchema {
            name: d.name,
            description: d.description,
            parameters: d.parameters,
        })
        .collect();

    let mut messages = vec![ChatMessage::user(query)];
    for _step in 0..10 {
        match transport.complete(&messages, &schemas, level).await? {
            ApiOutcome::Content(text) => return Ok(text),
            ApiOutcome::ToolCalls(calls) => {
                let mut assistant = ChatMessage::assistant("");
                assistant.tool_calls = calls.clone();
                messages.push(assistant);
                for call in calls {
                    let args = serde_json::from_str(&call.function.arguments)
                        .unwrap_or(serde_json::Value::Null);
                    let output = tools
                        .execute(&legate_tools::ToolCall {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            args,
                        })
                        .await;
                    messages.push(ChatMessage::tool_result(&call.id, output.content));
                }
            }
        }
    }
    bail!("tool loop exceeded its step budget")
}

fn print_result<T: serde::Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        println!("{}", text());
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_file = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(config_path);
    let config = load_config(&config_file);

    // ── Session management: store-only, no upstream ──────────────────────────
    if cli.session_list {
        let mut store = SessionStore::load(&sessions_path());
        store.cleanup_old(legate_core::SESSION_MAX_AGE_HOURS);
        let summary = store.summary();
        print_result(cli.json, &summary, || {
            let sessions = summary["sessions"].as_array().cloned().unwrap_or_default();
            let mut out = format!("{} sesiones activas\n", sessions.len());
            for s in sessions {
                out.push_str(&format!(
                    "  {} [{}] mensajes: {} tokens: {}\n",
                    s["name"].as_str().unwrap_or("?"),
                    s["mode"].as_str().unwrap_or("?"),
                    s["messages"],
                    s["tokens_invested"],
                ));
            }
            out
        });
        return Ok(());
    }
    if let Some(name) = &cli.session_close {
        let mut store = SessionStore::load(&sessions_path());
        let closed = store.close(name);
        print_result(cli.json, &serde_json::json!({ "closed": closed, "name": name }), || {
            if closed {
                format!("sesion '{name}' cerrada")
            } else {
                format!("sesion '{name}' no encontrada")
            }
        });
        if !closed {
            std::process::exit(1);
        }
        return Ok(());
    }
    if cli.session_close_all {
        let mut store = SessionStore::load(&sessions_path());
        let count = store.close_all();
        print_result(cli.json, &serde_json::json!({ "closed_count": count }), || {
            format!("{count} sesiones cerradas")
        });
        return Ok(());
    }
    if let Some(name) = &cli.session_digest {
        let store = SessionStore::load(&sessions_path());
        match store.digest(name) {
            Some(digest) => {
                print_result(cli.json, &digest, || {
                    format!(
                        "{} [{}]\n  tema: {}\n  resumen: {}\n  skills: {}",
                        digest.name,
                        digest.mode,
                        digest.topic,
                        digest.summary,
                        digest.skills.join(", ")
                    )
                });
                return Ok(());
            }
            None => bail!("sesion '{name}' no encontrada"),
        }
    }

    // ── Health report ────────────────────────────────────────────────────────
    if cli.health_report {
        let health = SessionHealth::new(config.clone(), &config_file);
        if detect_mode(&config) == CredentialMode::Web {
            let transport = build_web_transport(&config).await?;
            let probe = WebProbe(&transport);
            health.ensure_valid(&probe).await;
        }
        let status = health.status().await;
        print_result(cli.json, &status, || format!("{status:#?}"));
        return Ok(());
    }

    // ── Everything below needs an upstream backend ───────────────────────────
    let mode = detect_mode(&config);
    let tools = ToolRegistry::new();
    let limiter = RateLimiter::default_interactive();

    // Bare query over the direct API when no web credentials exist.
    if mode == CredentialMode::Api {
        let Some(query) = cli.query.as_deref() else {
            bail!("la API directa solo soporta consultas one-shot; los modos requieren sesion web");
        };
        limiter.wait_if_needed().await;
        println!("{}", run_api_query(&config, query, &tools).await?);
        return Ok(());
    }
    if mode == CredentialMode::None {
        bail!("sin credenciales: configura bearer_token+cookies o una API key");
    }

    let transport = build_web_transport(&config).await?;
    let store = tokio::sync::Mutex::new(SessionStore::load(&sessions_path()));
    let skills_dir = config.skills_dir.clone().map(PathBuf::from);
    let catalog = skills_dir
        .as_deref()
        .map(SkillCatalog::load)
        .filter(|c| !c.is_empty());

    let mut ctx = ModeContext::new(&transport, &tools, &store);
    ctx.skills = catalog.as_ref();
    ctx.data_dir = Some(data_dir());
    ctx.thinking_enabled = config.thinking_enabled;
    ctx.chunk_threshold_tokens = config.chunk_threshold_tokens as usize;

    limiter.wait_if_needed().await;

    if let Some(task) = cli.delegate {
        // Optional negotiation replaces the heuristic skill detection.
        let mut extra_injections = Vec::new();
        if cli.negotiate_skills {
            if let Some(catalog) = ctx.skills {
                let budget = legate_skills::budget_for(legate_model::TaskLevel::Delegation).total;
                extra_injections = negotiate_skills(&transport, catalog, &task, budget).await;
                if !extra_injections.is_empty() {
                    ctx.skills = None;
                }
            }
        }
        let options = DelegateOptions {
            task,
            template: read_file_arg(&cli.template, "template")?,
            context: read_file_arg(&cli.context, "context")?,
            feedback: cli.feedback,
            project_brief: read_file_arg(&cli.project_context, "project context")?,
            max_retries: cli.max_retries,
            validate: !cli.no_validate,
            session: cli.session,
            extra_injections,
        };
        let result = run_delegate(&ctx, options).await?;
        print_result(cli.json, &result, || result.response.clone());
        if !result.success {
            std::process::exit(1);
        }
        return Ok(());
    }

    if let Some(task) = cli.quantum {
        let transport_b = build_web_transport(&config).await?;
        let angles = cli.quantum_angles.as_deref().and_then(|raw| {
            raw.split_once(',')
                .map(|(a, b)| (a.trim().to_string(), b.trim().to_string()))
        });
        let options = QuantumOptions {
            task,
            template: read_file_arg(&cli.template, "template")?,
            angles,
        };
        let result = run_quantum(&ctx, &transport_b, options).await?;
        print_result(cli.json, &result, || result.merged.clone());
        return Ok(());
    }

    if let Some(task) = cli.multi {
        let roles = preset_roles(&cli.roles, cli.instances);
        let mut transports = Vec::with_capacity(roles.len());
        for _ in 0..roles.len() {
            transports.push(build_web_transport(&config).await?);
        }
        let instances: Vec<(&dyn ChatBackend, _)> = transports
            .iter()
            .map(|t| t as &dyn ChatBackend)
            .zip(roles)
            .collect();
        let session = MultiSession::new(instances);
        let base_system = legate_core::prompts::assemble_system_prompt(
            legate_model::TaskLevel::Delegation,
            legate_core::prompts::WorkShape::Generation,
        );
        let result = if cli.pipeline {
            session.sequential_pipeline(&task, &base_system).await
        } else {
            session.parallel_execute(&task, &base_system).await
        };
        print_result(cli.json, &result, || {
            result
                .results
                .iter()
                .map(|r| format!("== {} ==\n{}", r.role_label, r.response))
                .collect::<Vec<_>>()
                .join("\n\n")
        });
        if !result.all_success() {
            std::process::exit(1);
        }
        return Ok(());
    }

    if cli.converse.is_some() || cli.converse_file.is_some() {
        let messages: Vec<String> = match (&cli.converse, &cli.converse_file) {
            (Some(raw), _) => raw.split(',').map(|m| m.trim().to_string()).collect(),
            (_, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("converse file: {path}"))?
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(String::from)
                .collect(),
            _ => unreachable!("guarded above"),
        };
        let topic = cli.session.unwrap_or_else(|| {
            legate_index::slugify(messages.first().map(|m| m.as_str()).unwrap_or("tema"), 30)
        });
        let options = ConverseOptions {
            topic,
            messages,
            transfer_from: cli.transfer_from,
        };
        let result = run_converse(&ctx, options).await?;
        print_result(cli.json, &result, || result.final_response.clone());
        return Ok(());
    }

    if cli.multi_step.is_some() || cli.multi_step_inline.is_some() {
        let raw = match (&cli.multi_step, &cli.multi_step_inline) {
            (Some(path), _) => std::fs::read_to_string(path)
                .with_context(|| format!("plan file: {path}"))?,
            (_, Some(inline)) => inline.clone(),
            _ => unreachable!("guarded above"),
        };
        let plan = Plan::parse(&raw)?;
        let plan_id = cli
            .session
            .unwrap_or_else(|| legate_index::slugify(&plan.steps[0].task, 20));
        let pool: Vec<&dyn ChatBackend> = vec![&transport];
        let result = run_plan(&ctx, &pool, &plan_id, &plan).await?;
        print_result(cli.json, &result, || {
            result
                .results
                .iter()
                .map(|r| format!("[{}] {}", r.step_id, if r.success { "ok" } else { "FALLO" }))
                .collect::<Vec<_>>()
                .join("\n")
        });
        if !result.all_success() {
            std::process::exit(1);
        }
        return Ok(());
    }

    if let Some(doc_path) = cli.requirements {
        let doc = std::fs::read_to_string(&doc_path)
            .with_context(|| format!("requirements doc: {doc_path}"))?;
        let Some(plan) = legate_core::requirements::parse_requirements(&doc) else {
            bail!("el documento no contiene pasos reconocibles (headings o items numerados)");
        };
        if !cli.auto_execute {
            let steps: Vec<serde_json::Value> = plan
                .steps
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "id": s.id,
                        "task": s.task,
                        "context_from": s.context_from,
                    })
                })
                .collect();
            print_result(cli.json, &steps, || {
                plan.steps
                    .iter()
                    .map(|s| format!("[{}] {}", s.id, s.task.lines().next().unwrap_or("")))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            return Ok(());
        }
        let plan_id = legate_index::slugify(&plan.steps[0].task, 20);
        let pool: Vec<&dyn ChatBackend> = vec![&transport];
        let result = run_plan(&ctx, &pool, &plan_id, &plan).await?;
        print_result(cli.json, &result, || {
            result
                .results
                .iter()
                .map(|r| format!("[{}] {}", r.step_id, if r.success { "ok" } else { "FALLO" }))
                .collect::<Vec<_>>()
                .join("\n")
        });
        if !result.all_success() {
            std::process::exit(1);
        }
        return Ok(());
    }

    if let Some(goal) = cli.agent {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flag.store(true, Ordering::SeqCst);
            }
        });
        let mut options = AgentOptions::new(goal);
        options.trace_dir = Some(data_dir().join("agent_logs"));
        let result = run_agent(&ctx, options, interrupted).await?;
        print_result(cli.json, &result, || result.output.clone());
        return Ok(());
    }

    // ── Bare one-shot query (web mode) ───────────────────────────────────────
    if let Some(query) = cli.query {
        let transfer = match cli.transfer_from.as_deref() {
            Some(source) => {
                let store = store.lock().await;
                knowledge::build_knowledge_injection(&store, source)
            }
            None => None,
        };
        let call = SessionCall {
            system_prompt: Some(legate_core::prompts::assemble_system_prompt(
                classify_task(&query, false),
                legate_core::prompts::WorkShape::Generation,
            )),
            tools_prompt: legate_tools::tools_prompt(&tools.descriptors()),
            pending_injections: transfer.into_iter().collect(),
            thinking_enabled: config.thinking_enabled,
            ..SessionCall::new("oneshot", query)
        };
        let response = chat_in_session(&transport, &tools, &store, call).await?;
        println!("{response}");
        return Ok(());
    }

    bail!("nada que hacer: pasa una consulta o un flag de modo (--delegate, --agent, ...)")
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
