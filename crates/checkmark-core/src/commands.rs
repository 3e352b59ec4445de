use anyhow::anyhow;
use tracing::{debug, info, instrument, warn};

use crate::app::AppContext;
use crate::cli::Invocation;
use crate::render::Renderer;
use crate::storage::KvStore;
use crate::store::{LoadOutcome, MALFORMED_SUFFIX, Mutation};
use crate::theme::Theme;
use crate::todo::{Priority, TodoPatch};

pub fn known_command_names() -> Vec<&'static str> {
    vec![
        "list",
        "add",
        "show",
        "modify",
        "toggle",
        "delete",
        "theme",
        "priorities",
    ]
}

pub fn expand_command_abbrev<'a>(token: &'a str, known: &[&'a str]) -> Option<&'a str> {
    if known.contains(&token) {
        return Some(token);
    }

    let mut matches = known.iter().copied().filter(|name| name.starts_with(token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

#[instrument(skip(ctx, renderer, inv), fields(command = %inv.command))]
pub async fn dispatch<S: KvStore + Clone>(
    ctx: &AppContext<S>,
    renderer: &Renderer,
    inv: Invocation,
) -> anyhow::Result<()> {
    let (outcome, _) = ctx.start().await;
    if let Some(warning) = load_warning(outcome, ctx.todos.key()) {
        eprintln!("warning: {warning}");
    }

    let args = inv.args.as_slice();
    debug!(args = ?args, "dispatching");

    match inv.command.as_str() {
        "list" => cmd_list(ctx, renderer),
        "add" => cmd_add(ctx, renderer, args).await,
        "show" => cmd_show(ctx, renderer, args),
        "modify" => cmd_modify(ctx, renderer, args).await,
        "toggle" => cmd_toggle(ctx, args).await,
        "delete" => cmd_delete(ctx, args).await,
        "theme" => cmd_theme(ctx, renderer, args).await,
        "priorities" => renderer.print_priorities(),
        other => Err(anyhow!("unsupported command: {other}")),
    }
}

fn cmd_list<S: KvStore + Clone>(ctx: &AppContext<S>, renderer: &Renderer) -> anyhow::Result<()> {
    renderer.print_todo_table(&ctx.todos.todos(), ctx.theme.colors())
}

#[instrument(skip(ctx, renderer, args))]
async fn cmd_add<S: KvStore + Clone>(
    ctx: &AppContext<S>,
    renderer: &Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    info!("command add");

    let (title, mods) = parse_title_and_mods(args)?;
    let mut priority = None;
    for one_mod in mods {
        match one_mod {
            Mod::Priority(value) => priority = value,
            Mod::Done(_) => warn!("done: ignored on add; new todos start open"),
        }
    }

    let mutation = ctx.todos.add(&title, priority).await;
    let todo = report(mutation)?;
    println!("Created todo {}.", todo.id);
    renderer.print_todo_info(&todo, ctx.theme.colors())
}

fn cmd_show<S: KvStore + Clone>(
    ctx: &AppContext<S>,
    renderer: &Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    let id = single_id(args, "show")?;
    let todo = ctx
        .todos
        .get(id)
        .ok_or_else(|| anyhow!("no todo with id {id}"))?;
    renderer.print_todo_info(&todo, ctx.theme.colors())
}

#[instrument(skip(ctx, renderer, args))]
async fn cmd_modify<S: KvStore + Clone>(
    ctx: &AppContext<S>,
    renderer: &Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    info!("command modify");

    let (id, rest) = args
        .split_first()
        .ok_or_else(|| anyhow!("modify requires a todo id"))?;
    let patch = parse_patch(rest)?;
    if patch.is_empty() {
        return Err(anyhow!(
            "modify: nothing to change (give new title words, priority:P or done:yes/no)"
        ));
    }

    let todo = report(ctx.todos.update(id, patch).await)?;
    println!("Modified todo {}.", todo.id);
    renderer.print_todo_info(&todo, ctx.theme.colors())
}

#[instrument(skip(ctx, args))]
async fn cmd_toggle<S: KvStore + Clone>(
    ctx: &AppContext<S>,
    args: &[String],
) -> anyhow::Result<()> {
    info!("command toggle");

    let id = single_id(args, "toggle")?;
    let todo = report(ctx.todos.toggle(id).await)?;
    let state = if todo.completed { "completed" } else { "reopened" };
    println!("Todo {} {state}.", todo.id);
    Ok(())
}

#[instrument(skip(ctx, args))]
async fn cmd_delete<S: KvStore + Clone>(
    ctx: &AppContext<S>,
    args: &[String],
) -> anyhow::Result<()> {
    info!("command delete");

    let id = single_id(args, "delete")?;
    let todo = report(ctx.todos.delete(id).await)?;
    println!("Deleted todo {} '{}'.", todo.id, todo.title);
    Ok(())
}

#[instrument(skip(ctx, renderer, args))]
async fn cmd_theme<S: KvStore + Clone>(
    ctx: &AppContext<S>,
    renderer: &Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    match args {
        [] => {}
        [action] if action == "toggle" => {
            ctx.theme.toggle_theme().await;
        }
        [name] => {
            let theme: Theme = name.parse()?;
            ctx.theme.set_theme(theme).await;
        }
        _ => return Err(anyhow!("theme takes at most one argument: toggle, light or dark")),
    }

    renderer.print_theme(ctx.theme.theme(), ctx.theme.persists())
}

fn load_warning(outcome: LoadOutcome, key: &str) -> Option<String> {
    match outcome {
        LoadOutcome::Malformed => Some(format!(
            "stored todo list '{key}' was unreadable; a '{key}{MALFORMED_SUFFIX}' copy was kept \
             and the list starts empty"
        )),
        LoadOutcome::Failed => Some(format!(
            "could not read stored todos '{key}'; showing an empty list and refusing changes"
        )),
        LoadOutcome::Loaded(_) | LoadOutcome::Empty => None,
    }
}

/// Turns a store outcome into the front-end's exit behavior: rejections are
/// errors, unsaved changes are warnings.
fn report<T>(mutation: Mutation<T>) -> anyhow::Result<T> {
    match mutation {
        Mutation::Persisted(value) => Ok(value),
        Mutation::Unpersisted { value, error } => {
            eprintln!("warning: change applied but not saved: {error:#}");
            Ok(value)
        }
        Mutation::Rejected(rejection) => Err(anyhow!(rejection.to_string())),
    }
}

fn single_id<'a>(args: &'a [String], command: &str) -> anyhow::Result<&'a str> {
    match args {
        [id] => Ok(id.as_str()),
        [] => Err(anyhow!("{command} requires a todo id")),
        _ => Err(anyhow!("{command} takes exactly one todo id")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mod {
    Priority(Option<Priority>),
    Done(bool),
}

fn parse_title_and_mods(args: &[String]) -> anyhow::Result<(String, Vec<Mod>)> {
    let mut title_parts = Vec::new();
    let mut mods = Vec::new();

    let mut literal = false;
    for arg in args {
        if arg == "--" {
            literal = true;
            continue;
        }

        if !literal && let Some(one_mod) = parse_one_mod(arg)? {
            mods.push(one_mod);
            continue;
        }

        title_parts.push(arg.as_str());
    }

    Ok((title_parts.join(" "), mods))
}

fn parse_patch(args: &[String]) -> anyhow::Result<TodoPatch> {
    let (title, mods) = parse_title_and_mods(args)?;
    let mut patch = TodoPatch::default();
    if !title.is_empty() {
        patch.title = Some(title);
    }

    for one_mod in mods {
        match one_mod {
            Mod::Priority(value) => patch.priority = Some(value),
            Mod::Done(value) => patch.completed = Some(value),
        }
    }
    Ok(patch)
}

fn parse_one_mod(tok: &str) -> anyhow::Result<Option<Mod>> {
    let Some((key, value)) = tok.split_once(':') else {
        return Ok(None);
    };

    match key.to_ascii_lowercase().as_str() {
        "pri" | "priority" => {
            if value.trim().is_empty() {
                Ok(Some(Mod::Priority(None)))
            } else {
                Ok(Some(Mod::Priority(Some(value.parse()?))))
            }
        }
        "done" | "completed" => match value.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" | "1" | "on" => Ok(Some(Mod::Done(true))),
            "no" | "n" | "false" | "0" | "off" => Ok(Some(Mod::Done(false))),
            other => Err(anyhow!("invalid done value '{other}', expected yes or no")),
        },
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Mod, dispatch, expand_command_abbrev, known_command_names, load_warning, parse_patch,
        parse_title_and_mods, report,
    };
    use crate::app::AppContext;
    use crate::cli::Invocation;
    use crate::config::Config;
    use crate::render::Renderer;
    use crate::storage::{KvStore, MemoryKvStore};
    use crate::store::{LoadOutcome, Mutation, Rejection};
    use crate::theme::{THEME_KEY, Theme};
    use crate::todo::{Priority, Todo};

    fn strings(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|tok| tok.to_string()).collect()
    }

    #[test]
    fn unique_prefixes_expand() {
        let known = known_command_names();
        assert_eq!(expand_command_abbrev("del", &known), Some("delete"));
        assert_eq!(expand_command_abbrev("pri", &known), Some("priorities"));
        assert_eq!(expand_command_abbrev("t", &known), None);
    }

    #[test]
    fn title_words_and_priority() {
        let (title, mods) =
            parse_title_and_mods(&strings(&["Buy", "milk", "priority:high"])).expect("parse");
        assert_eq!(title, "Buy milk");
        assert_eq!(mods, vec![Mod::Priority(Some(Priority::High))]);
    }

    #[test]
    fn double_dash_keeps_colons_in_title() {
        let (title, mods) =
            parse_title_and_mods(&strings(&["--", "note:", "pri:H"])).expect("parse");
        assert_eq!(title, "note: pri:H");
        assert!(mods.is_empty());
    }

    #[test]
    fn patch_from_modifiers() {
        let patch = parse_patch(&strings(&["pri:", "done:yes"])).expect("parse");
        assert_eq!(patch.title, None);
        assert_eq!(patch.priority, Some(None));
        assert_eq!(patch.completed, Some(true));

        assert!(parse_patch(&strings(&["priority:urgent"])).is_err());
        assert!(parse_patch(&strings(&["done:maybe"])).is_err());
    }

    async fn run(backend: &MemoryKvStore, command: &str, args: &[&str]) -> anyhow::Result<()> {
        let ctx = AppContext::new(backend.clone(), &Config::defaults()).expect("context");
        let inv = Invocation {
            command: command.to_string(),
            args: strings(args),
        };
        dispatch(&ctx, &Renderer::plain(), inv).await
    }

    async fn stored(backend: &MemoryKvStore) -> Vec<Todo> {
        let raw = backend
            .get("todos")
            .await
            .expect("read slot")
            .expect("slot written");
        serde_json::from_str(&raw).expect("stored list parses")
    }

    async fn stored_theme(backend: &MemoryKvStore) -> Option<String> {
        backend.get(THEME_KEY).await.expect("read theme")
    }

    #[tokio::test]
    async fn commands_drive_the_store_across_runs() {
        let backend = MemoryKvStore::new();

        run(&backend, "add", &["Buy", "milk", "pri:H"]).await.expect("add");
        let todos = stored(&backend).await;
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].title, "Buy milk");
        assert_eq!(todos[0].priority, Some(Priority::High));
        let id = todos[0].id.clone();
        let id = id.as_str();

        run(&backend, "modify", &[id, "Buy", "oat", "milk", "priority:low"])
            .await
            .expect("modify");
        run(&backend, "toggle", &[id]).await.expect("toggle");
        let todos = stored(&backend).await;
        assert_eq!(todos[0].title, "Buy oat milk");
        assert_eq!(todos[0].priority, Some(Priority::Low));
        assert!(todos[0].completed);

        run(&backend, "list", &[]).await.expect("list");
        run(&backend, "show", &[id]).await.expect("show");

        run(&backend, "delete", &[id]).await.expect("delete");
        assert!(stored(&backend).await.is_empty());

        let err = run(&backend, "delete", &[id]).await.expect_err("already gone");
        assert_eq!(err.to_string(), format!("no todo with id {id}"));
        assert!(run(&backend, "toggle", &["42"]).await.is_err());
        assert!(run(&backend, "add", &["   "]).await.is_err());
    }

    #[tokio::test]
    async fn theme_command_toggles_and_sets() {
        let backend = MemoryKvStore::new();

        run(&backend, "theme", &[]).await.expect("show");
        assert_eq!(stored_theme(&backend).await, None);

        run(&backend, "theme", &["toggle"]).await.expect("toggle");
        assert_eq!(stored_theme(&backend).await.as_deref(), Some(Theme::Dark.storage_value()));
        run(&backend, "theme", &["toggle"]).await.expect("toggle back");
        assert_eq!(stored_theme(&backend).await.as_deref(), Some(Theme::Light.storage_value()));

        run(&backend, "theme", &["dark"]).await.expect("dark");
        assert_eq!(stored_theme(&backend).await.as_deref(), Some("dark"));
        run(&backend, "theme", &["light"]).await.expect("light");
        assert_eq!(stored_theme(&backend).await.as_deref(), Some("light"));

        assert!(run(&backend, "theme", &["sepia"]).await.is_err());
        assert!(run(&backend, "theme", &["dark", "light"]).await.is_err());
    }

    #[test]
    fn outcomes_map_to_exit_behavior() {
        assert_eq!(report(Mutation::Persisted(1)).expect("saved"), 1);
        let unsaved = Mutation::Unpersisted {
            value: 2,
            error: anyhow::anyhow!("disk full"),
        };
        assert_eq!(report(unsaved).expect("kept in memory"), 2);
        let refused: Mutation<u8> = Mutation::Rejected(Rejection::StorageUnread);
        assert!(report(refused).is_err());

        assert!(load_warning(LoadOutcome::Loaded(3), "todos").is_none());
        assert!(load_warning(LoadOutcome::Empty, "todos").is_none());
        let warning = load_warning(LoadOutcome::Malformed, "todos").expect("warning");
        assert!(warning.contains("todos.malformed"));
        assert!(load_warning(LoadOutcome::Failed, "todos").is_some());
    }
}
