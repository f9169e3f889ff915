//! Normalizes a raw `(tag, payload)` pair into a [`ParsedEvent`]. Ports the
//! field-by-field projection, state-return distillation, and rename-rule
//! application straight out of the reference implementation's event parser,
//! trading its duck-typed dict walking for explicit `serde_json::Value`
//! matching.

use crate::event::{JobId, ParsedEvent, StateFunArgs};
use crate::rules::RenameRules;
use crate::tags::{get_tag_mask, well_known};
use crate::util::{get_trimmed, parse_duration, parse_state_fun_args, parse_timestamp, split_state_tags};
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashSet;

/// `fun` values for which a state run's argument list and return map get the
/// extra rewriting pass: positional args renamed via the `mod` rule set, and
/// (for the `return` map) each state's `__sls__`/`__id__` renamed via the
/// `sls`/`sid` rule sets.
fn state_funcs() -> &'static HashSet<&'static str> {
    use std::sync::OnceLock;
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            "state.sls",
            "state.sls_id",
            "state.apply",
            "state.highstate",
            "state.single",
            "state.show_sls",
            "state.top",
        ]
        .into_iter()
        .collect()
    })
}

/// `(tag_main, tag_sub)` pairs for which a missing `fun` is expected and
/// should not be logged — `salt/key` and `salt/stats` events never carry one.
fn ignore_no_fun_warning() -> &'static HashSet<(&'static str, &'static str)> {
    use std::sync::OnceLock;
    static SET: OnceLock<HashSet<(&'static str, &'static str)>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            (well_known::SALT_KEY, ""),
            (well_known::SALT_STATS, ""),
            (well_known::SALT_BATCH, well_known::SALT_BATCH_START),
            (well_known::SALT_BATCH, well_known::SALT_BATCH_DONE),
        ]
        .into_iter()
        .collect()
    })
}

/// `(tag_main, tag_sub, fun)` triples that are dropped unconditionally, with
/// no warning — bus noise the system has no use for.
fn ignore_events() -> &'static HashSet<(&'static str, &'static str, Option<&'static str>)> {
    use std::sync::OnceLock;
    static SET: OnceLock<HashSet<(&'static str, &'static str, Option<&'static str>)>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            (well_known::SALT_JOB, well_known::SALT_JOB_NEW, Some("saltutil.find_job")),
            (well_known::SALT_JOB, well_known::SALT_JOB_RET, Some("saltutil.find_job")),
            (well_known::SALT_JOB, well_known::SALT_JOB_PROG, Some("saltutil.find_job")),
        ]
        .into_iter()
        .collect()
    })
}

const RETURN_SKIP_KEYS: &[&str] = &["return", "_stamp", "fun", "fun_args", "jid", "id"];

/// Parses raw bus events into [`ParsedEvent`]s, applying the configured
/// rename rules to SLS references, state ids, and state module args.
pub struct EventParser {
    rename_rules: RenameRules,
}

impl EventParser {
    pub fn new(rename_rules: RenameRules) -> Self {
        EventParser { rename_rules }
    }

    /// Returns `None` for events that are malformed, intentionally ignored,
    /// or missing a `fun` the event shape requires — never an error, since a
    /// single bad event must never take down the parser pool.
    pub fn parse(&self, tag: &str, payload: &Value) -> Option<ParsedEvent> {
        let payload = payload.as_object()?;
        let info = get_tag_mask(tag);

        let mut fun = payload.get("fun").and_then(Value::as_str).map(str::to_string);

        if info.tag_main == well_known::SALT_KEY && fun.is_none() {
            fun = payload.get("act").and_then(Value::as_str).map(str::to_string);
        }

        if fun.is_none() {
            let key = (info.tag_main.as_str(), info.tag_sub.as_str());
            if !ignore_no_fun_warning().contains(&key) {
                warn!("event {tag} has no fun and is not in the ignore list, dropping");
                return None;
            }
        }

        let ignore_key = (info.tag_main.as_str(), info.tag_sub.as_str(), fun.as_deref());
        if ignore_events().contains(&ignore_key) {
            debug!("dropping ignored event {tag} (fun={fun:?})");
            return None;
        }

        let ts = parse_timestamp(payload.get("_stamp"));
        let mut event = ParsedEvent::new(tag.to_string(), info.tag_mask, info.tag_main.clone(), info.tag_sub.clone(), ts);

        event.jid = payload.get("jid").and_then(Value::as_str).map(JobId::parse);
        event.id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(info.minion_id);
        event.user = payload.get("user").and_then(Value::as_str).map(str::to_string);
        event.minions = payload
            .get("minions")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect());
        event.success = payload.get("success").and_then(Value::as_bool);
        event.fun = fun.clone();
        event.test = payload.get("test").and_then(Value::as_bool);

        if info.tag_main == well_known::SALT_BATCH
            && (info.tag_sub == well_known::SALT_BATCH_START || info.tag_sub == well_known::SALT_BATCH_DONE)
        {
            event.down_minions = payload
                .get("down_minions")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect());
        }

        let stderr_nonempty = payload.get("stderr").and_then(Value::as_str).is_some_and(|s| !s.is_empty());
        if payload.get("retcode") == Some(&Value::from(255)) && stderr_nonempty {
            event.offline = Some(true);
        }

        if let (Some(f), Some(fun_args)) = (&fun, payload.get("fun_args")) {
            if state_funcs().contains(f.as_str()) {
                let (mut args, kwargs) = parse_state_fun_args(fun_args);
                for arg in args.iter_mut() {
                    *arg = self.rename_rules.mod_.apply(arg).into_owned();
                }
                let test = kwargs.get("test").and_then(Value::as_bool).unwrap_or(false);
                event.state_fun_args = Some(StateFunArgs { fun: f.clone(), args, test });
            }
        }

        if let Some(ret) = payload.get("return") {
            let is_state_return = info.tag_sub == well_known::SALT_JOB_RET
                && fun.as_deref().is_some_and(|f| state_funcs().contains(f));
            let mut ret = ret.clone();
            if is_state_return {
                let tally = self.distill_state_return(&mut ret);
                event.changes = tally.changes;
                event.errors = tally.errors;
                event.warnings = tally.warnings;
                event.successes = tally.successes;
                event.failures = tally.failures;
                event.duration = tally.duration;
            } else {
                match &ret {
                    Value::String(_) => event.changes = Some(1),
                    Value::Array(items) => event.errors = Some(items.len() as u64),
                    _ => {}
                }
            }
            event.return_value = Some(ret);
        }

        if info.tag_main == well_known::SALT_STATS {
            event.stats = payload.get("stats").cloned();
        }

        event.trimmed = get_trimmed(payload, RETURN_SKIP_KEYS);
        Some(event)
    }

    /// Walks a state run's `return` map (`state_id_|-name_|-module_|-fun ->
    /// result`), rewriting `__sls__`/`__id__` in place and tallying outcomes.
    /// Non-state returns (a plain scalar or a shape without the `_|-`
    /// delimiter) pass through with a zeroed tally — there is nothing to
    /// distill.
    fn distill_state_return(&self, ret: &mut Value) -> ReturnTally {
        let mut tally = ReturnTally::default();

        let Some(map) = ret.as_object_mut() else {
            return tally;
        };

        for (rtag, entry) in map.iter_mut() {
            let Some(obj) = entry.as_object_mut() else {
                continue;
            };
            let (state_id, state_fun, _state_name) = split_state_tags(rtag);
            if state_id.is_none() {
                // Not a state-run return shape (e.g. a bare module.run call).
                continue;
            }

            if let Some(sls) = obj.get("__sls__").and_then(Value::as_str).map(str::to_string) {
                let dotted = sls.replace('/', ".");
                let renamed = self.rename_rules.sls.apply(&dotted).into_owned();
                if renamed != dotted {
                    obj.insert("__sls_orig__".to_string(), Value::String(dotted));
                }
                obj.insert("__sls__".to_string(), Value::String(renamed));
            }

            if let Some(id) = obj.get("__id__").and_then(Value::as_str).map(str::to_string) {
                let renamed = self.rename_rules.sid.apply(&id).into_owned();
                if renamed != id {
                    obj.insert("__id_orig__".to_string(), Value::String(id));
                }
                obj.insert("__id__".to_string(), Value::String(renamed));
            }

            if let Some(fun) = state_fun {
                obj.insert("fun".to_string(), Value::String(fun));
            }

            let ran = obj.get("__state_ran__").and_then(Value::as_bool);
            let result = if ran == Some(false) {
                obj.remove("__state_ran__");
                None
            } else {
                obj.get("result").cloned()
            };

            match result {
                Some(Value::Bool(true)) => *tally.successes.get_or_insert(0) += 1,
                Some(Value::Bool(false)) => *tally.failures.get_or_insert(0) += 1,
                Some(Value::Null) | None => *tally.warnings.get_or_insert(0) += 1,
                _ => {}
            }

            if obj.contains_key("warnings") {
                *tally.warnings.get_or_insert(0) += 1;
            }
            if let Some(changes) = obj.get("changes").and_then(Value::as_object) {
                if !changes.is_empty() {
                    *tally.changes.get_or_insert(0) += 1;
                }
            }
            if obj.get("comment").and_then(Value::as_str).is_some_and(|c| c.to_lowercase().contains("error")) {
                *tally.errors.get_or_insert(0) += 1;
            }

            obj.remove("start_time");

            if let Some(duration) = obj.get("duration").and_then(parse_duration) {
                *tally.duration.get_or_insert(0.0) += duration;
            }
        }

        tally
    }
}

#[derive(Default)]
struct ReturnTally {
    successes: Option<u64>,
    failures: Option<u64>,
    warnings: Option<u64>,
    changes: Option<u64>,
    errors: Option<u64>,
    duration: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RenameRules;
    use serde_json::json;

    fn parser() -> EventParser {
        EventParser::new(RenameRules::empty())
    }

    #[test]
    fn parses_job_new_event() {
        let payload = json!({
            "fun": "state.apply",
            "jid": "20240101000001",
            "user": "root",
            "minions": ["web1", "web2"],
            "fun_args": ["webserver", {"test": true}],
        });
        let event = parser().parse("salt/job/20240101000001/new", &payload).unwrap();
        assert_eq!(event.tag_main, "job");
        assert_eq!(event.tag_sub, "new");
        assert_eq!(event.fun.as_deref(), Some("state.apply"));
        assert_eq!(event.jid, Some(JobId::Int(20240101000001)));
        let sfa = event.state_fun_args.unwrap();
        assert_eq!(sfa.args, vec!["webserver".to_string()]);
        assert!(sfa.test);
    }

    #[test]
    fn applies_mod_rename_rule_to_state_args() {
        let rules = RenameRules {
            mod_: crate::rules::RuleSet::compile(&[("^web(.*)$".to_string(), "wwweb$1".to_string())]).unwrap(),
            ..RenameRules::empty()
        };
        let parser = EventParser::new(rules);
        let payload = json!({
            "fun": "state.sls",
            "fun_args": ["webserver"],
        });
        let event = parser.parse("salt/job/1/new", &payload).unwrap();
        assert_eq!(event.state_fun_args.unwrap().args, vec!["wwwebserver".to_string()]);
    }

    #[test]
    fn missing_fun_without_ignore_entry_drops_event() {
        let payload = json!({"jid": "1"});
        assert!(parser().parse("salt/job/1/new", &payload).is_none());
    }

    #[test]
    fn key_event_without_fun_is_not_dropped() {
        let payload = json!({"act": "accept", "id": "minion-a"});
        let event = parser().parse("salt/key", &payload).unwrap();
        assert_eq!(event.fun.as_deref(), Some("accept"));
    }

    #[test]
    fn ignored_event_triple_returns_none() {
        let payload = json!({"fun": "saltutil.find_job"});
        assert!(parser().parse("salt/job/1/new", &payload).is_none());
    }

    #[test]
    fn distills_state_return_and_renames_sls() {
        let rules = RenameRules {
            sls: crate::rules::RuleSet::compile(&[("^common/(.*)$".to_string(), "shared.$1".to_string())]).unwrap(),
            ..RenameRules::empty()
        };
        let parser = EventParser::new(rules);
        let payload = json!({
            "fun": "state.apply",
            "return": {
                "file_|-/etc/hosts_|-/etc/hosts_|-managed": {
                    "result": true,
                    "__sls__": "common/hosts",
                    "__id__": "/etc/hosts",
                    "changes": {"diff": "..."},
                    "duration": 12.5,
                    "start_time": "10:00:00.000000",
                },
                "pkg_|-nginx_|-nginx_|-installed": {
                    "result": false,
                    "__sls__": "common/hosts",
                    "duration": "5 ms",
                },
            },
        });
        let event = parser.parse("salt/job/1/ret/minion-a", &payload).unwrap();
        assert_eq!(event.successes, Some(1));
        assert_eq!(event.failures, Some(1));
        assert_eq!(event.changes, Some(1));
        assert_eq!(event.duration, Some(17.5));

        let ret = event.return_value.unwrap();
        let first = &ret["file_|-/etc/hosts_|-/etc/hosts_|-managed"];
        assert_eq!(first["__sls__"], json!("shared.hosts"));
        assert_eq!(first["__sls_orig__"], json!("common.hosts"));
        assert!(first.get("start_time").is_none());
    }

    #[test]
    fn empty_return_map_has_zero_tally() {
        let payload = json!({"fun": "state.apply", "return": {}});
        let event = parser().parse("salt/job/1/ret", &payload).unwrap();
        assert_eq!(event.successes, None);
        assert_eq!(event.duration, None);
    }

    #[test]
    fn string_return_counts_as_a_single_change() {
        let payload = json!({"fun": "cmd.run", "return": "command output"});
        let event = parser().parse("salt/job/1/ret", &payload).unwrap();
        assert_eq!(event.changes, Some(1));
        assert_eq!(event.return_value, Some(json!("command output")));
        assert_eq!(event.successes, None);
    }

    #[test]
    fn list_return_counts_as_errors() {
        let payload = json!({"fun": "cmd.run", "return": ["one", "two", "three"]});
        let event = parser().parse("salt/job/1/ret", &payload).unwrap();
        assert_eq!(event.errors, Some(3));
        assert_eq!(event.changes, None);
    }

    #[test]
    fn ssh_offline_requires_retcode_255_and_nonempty_stderr() {
        let payload = json!({
            "fun": "cmd.run",
            "retcode": 255,
            "stderr": "ssh: connection refused",
        });
        let event = parser().parse("salt/job/1/ret", &payload).unwrap();
        assert_eq!(event.offline, Some(true));

        let not_offline = json!({"fun": "cmd.run", "retcode": 255, "stderr": ""});
        let event = parser().parse("salt/job/1/ret", &not_offline).unwrap();
        assert_eq!(event.offline, None);

        let wrong_retcode = json!({"fun": "cmd.run", "retcode": 1, "stderr": "boom"});
        let event = parser().parse("salt/job/1/ret", &wrong_retcode).unwrap();
        assert_eq!(event.offline, None);
    }

    #[test]
    fn batch_down_minions_only_fires_on_batch_start_and_done() {
        let payload = json!({"fun": "batch.run", "down_minions": ["web1", "web2"]});
        let event = parser().parse("salt/batch/1/start", &payload).unwrap();
        assert_eq!(event.down_minions, Some(vec!["web1".to_string(), "web2".to_string()]));

        let job_payload = json!({"fun": "state.apply", "down_minions": ["web1"]});
        let event = parser().parse("salt/job/1/new", &job_payload).unwrap();
        assert_eq!(event.down_minions, None);
    }

    #[test]
    fn stats_passthrough_reads_stats_key() {
        let payload = json!({"stats": {"uptime": 42}});
        let event = parser().parse("salt/stats", &payload).unwrap();
        assert_eq!(event.stats, Some(json!({"uptime": 42})));
    }
}
