//! Named admin commands: a string-keyed control surface over the scheduler.
//!
//! Every command takes a JSON argument object and returns a JSON value.
//! Failures never escape: an unknown or failing command answers
//! `{"ok": false, "error": "..."}`.

use std::sync::{Arc, Weak};

use anyhow::Context as _;
use serde_json::{json, Value};

use crate::engine::Scheduler;
use crate::job::JobFilter;

pub type AdminCommand = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

impl Scheduler {
    /// Register `cmd`, replacing any command of the same name.
    pub fn register_admin_command<F>(&self, cmd: &str, func: F)
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.admin_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cmd.to_string(), Arc::new(func));
    }

    pub fn run_admin_command(&self, cmd: &str, args: &Value) -> Value {
        let func = self
            .admin_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(cmd)
            .cloned();
        let Some(func) = func else {
            return json!({"ok": false, "error": "Unknown command"});
        };
        match func(args) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Admin command '{cmd}' failed: {e:#}");
                json!({"ok": false, "error": e.to_string()})
            }
        }
    }

    pub fn admin_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .admin_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Register the built-in commands: `list_jobs`, `stats`, `diagnostics`,
    /// `run_now`, `pause_job`, `resume_job`, `enable_job`, `disable_job`
    /// and `remove_job`. The job commands take `{"name": ...}`.
    pub fn register_builtin_admin_commands(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);

        self.register_admin_command(
            "list_jobs",
            builtin(weak.clone(), |s, args| {
                let filter = JobFilter {
                    tags: args["tags"]
                        .as_array()
                        .map(|tags| {
                            tags.iter()
                                .filter_map(|t| t.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                    group: args["group"].as_str().map(String::from),
                    user: args["user"].as_str().map(String::from),
                };
                Ok(serde_json::to_value(s.list_jobs(&filter))?)
            }),
        );
        self.register_admin_command(
            "stats",
            builtin(weak.clone(), |s, _| Ok(serde_json::to_value(s.get_stats())?)),
        );
        self.register_admin_command(
            "diagnostics",
            builtin(weak.clone(), |s, _| Ok(serde_json::to_value(s.diagnostics())?)),
        );
        self.register_admin_command(
            "run_now",
            builtin(weak.clone(), |s, args| {
                let name = job_name(args)?;
                let record = s
                    .run_now(name)
                    .with_context(|| format!("no such job: {name}"))?;
                Ok(json!({"ok": true, "run": record}))
            }),
        );

        let toggles: [(&str, fn(&Scheduler, &str) -> bool); 4] = [
            ("pause_job", Scheduler::pause_job),
            ("resume_job", Scheduler::resume_job),
            ("enable_job", Scheduler::enable_job),
            ("disable_job", Scheduler::disable_job),
        ];
        for (cmd, toggle) in toggles {
            self.register_admin_command(
                cmd,
                builtin(weak.clone(), move |s, args| {
                    Ok(json!({"ok": toggle(s, job_name(args)?)}))
                }),
            );
        }
        self.register_admin_command(
            "remove_job",
            builtin(weak.clone(), |s, args| {
                Ok(json!({"ok": s.remove_job(job_name(args)?).is_some()}))
            }),
        );
    }
}

fn job_name(args: &Value) -> anyhow::Result<&str> {
    args["name"]
        .as_str()
        .context("missing 'name' argument")
}

/// Wrap a command so it holds the scheduler weakly.
fn builtin<F>(
    weak: Weak<Scheduler>,
    func: F,
) -> impl Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static
where
    F: Fn(&Scheduler, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    move |args: &Value| {
        let scheduler = weak.upgrade().context("scheduler dropped")?;
        func(&scheduler, args)
    }
}
