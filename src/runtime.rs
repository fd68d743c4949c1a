//! Process-wide engine for callers that do not want to thread an
//! [`Engine`] handle around.

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::executor::{SubmitOptions, TaskArgs, TaskId, TaskOutcome};
use parking_lot::RwLock;
use std::fmt::Display;

static GLOBAL_ENGINE: RwLock<Option<Engine>> = RwLock::new(None);

/// Creates and starts the global engine with the default config.
pub fn init() -> Result<()> {
    init_with_config(Config::default())
}

pub fn init_with_config(config: Config) -> Result<()> {
    let mut global = GLOBAL_ENGINE.write();
    if global.is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let engine = Engine::new(config)?;
    engine.start()?;
    *global = Some(engine);
    Ok(())
}

/// The global engine, created with the default config and started on
/// first use.
pub fn global() -> Result<Engine> {
    if let Some(engine) = GLOBAL_ENGINE.read().as_ref() {
        return Ok(engine.clone());
    }

    let mut global = GLOBAL_ENGINE.write();
    // another thread may have won the race
    if let Some(engine) = global.as_ref() {
        return Ok(engine.clone());
    }

    let engine = Engine::new(Config::default())?;
    engine.start()?;
    *global = Some(engine.clone());
    Ok(engine)
}

/// The global engine if one exists, without creating it.
pub fn try_global() -> Result<Engine> {
    GLOBAL_ENGINE.read().clone().ok_or(Error::NotInitialized)
}

/// Stops and forgets the global engine. A later [`global`] call creates a
/// fresh one.
pub fn shutdown() {
    let engine = GLOBAL_ENGINE.write().take();
    if let Some(engine) = engine {
        engine.stop();
    }
}

pub fn register<F>(name: impl Into<String>, f: F) -> Result<()>
where
    F: Fn(&TaskArgs) -> TaskOutcome + Send + Sync + 'static,
{
    global()?.register(name, f);
    Ok(())
}

pub fn submit(function_name: &str, args: TaskArgs, options: SubmitOptions) -> Result<TaskId> {
    global()?.submit(function_name, args, options)
}

pub fn parallel_map<T, R, E, F>(
    f: F,
    items: Vec<T>,
    max_workers: Option<usize>,
    use_processes: bool,
) -> Result<Vec<Option<R>>>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Display + 'static,
    F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
{
    global()?.parallel_map(f, items, max_workers, use_processes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    // one test so the shared global is never raced by the harness
    #[test]
    fn test_global_lifecycle() {
        shutdown();
        assert!(matches!(try_global(), Err(Error::NotInitialized)));

        let config = Config::builder()
            .num_workers(1)
            .max_workers(2)
            .poll_interval(Duration::from_millis(20))
            .build()
            .unwrap();
        init_with_config(config.clone()).unwrap();
        assert!(matches!(init_with_config(config), Err(Error::AlreadyInitialized)));

        register("hello", |args: &TaskArgs| {
            let name: String = args.get(0)?;
            Ok(json!(format!("hello {}", name)))
        })
        .unwrap();
        let id = submit("hello", TaskArgs::positional(["world"]), SubmitOptions::default()).unwrap();
        let engine = global().unwrap();
        assert_eq!(
            engine.result(&id, Some(Duration::from_secs(5))).unwrap(),
            json!("hello world")
        );

        let doubled = parallel_map(|x: i32| Ok::<_, String>(x * 2), vec![1, 2, 3], None, false).unwrap();
        assert_eq!(doubled, vec![Some(2), Some(4), Some(6)]);

        shutdown();
        assert!(!engine.is_running());
        assert!(try_global().is_err());
    }
}
