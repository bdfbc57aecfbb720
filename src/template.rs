//! Template variable expansion.
//!
//! Expansion is purely textual, left-to-right, and non-recursive: each
//! recognized `${VAR}` token is replaced once and the replacement is never
//! re-scanned for further variables. Unknown variables pass through
//! unchanged.

use crate::models::pipeline::TaskDefinition;

/// The set of variables available while expanding one task's descriptor.
#[derive(Debug, Clone)]
pub struct Scope<'a> {
    pub root_path: &'a str,
    pub work_path: &'a str,
    pub run_path: &'a str,
    pub task_id: &'a str,
    pub task_name: &'a str,
    pub pipe_id: &'a str,
}

impl<'a> Scope<'a> {
    fn pairs(&self) -> [(&'static str, &'a str); 6] {
        [
            ("${ROOT_PATH}", self.root_path),
            ("${WORK_PATH}", self.work_path),
            ("${RUN_PATH}", self.run_path),
            ("${TASK_ID}", self.task_id),
            ("${TASK_NAME}", self.task_name),
            ("${PIPE_ID}", self.pipe_id),
        ]
    }
}

/// Expand every recognized variable in `input`, left to right, without
/// recursive re-expansion. Idempotent: expanding an already-expanded string
/// is a no-op because none of the replacement values can themselves contain
/// a literal `${...}` token produced by this function.
pub fn expand(input: &str, scope: &Scope) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let Some(end_rel) = rest[start..].find('}') else {
            // Unterminated token; nothing left to substitute, copy the
            // remainder unchanged.
            out.push_str(rest);
            return out;
        };
        let end = start + end_rel;
        out.push_str(&rest[..start]);

        let token = &rest[start..=end];
        let replacement = scope
            .pairs()
            .iter()
            .find(|(var, _)| *var == token)
            .map(|(_, value)| *value);

        match replacement {
            Some(value) => out.push_str(value),
            // Unknown variable: pass through unchanged.
            None => out.push_str(token),
        }

        rest = &rest[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Expand every templated string field of a task descriptor: `args`,
/// `image`, `command`, and mount `path`s.
pub fn expand_task(task: &TaskDefinition, scope: &Scope) -> TaskDefinition {
    let mut expanded = task.clone();
    expanded.image = expand(&task.image, scope);
    expanded.command = task.command.iter().map(|c| expand(c, scope)).collect();
    expanded.args = task.args.iter().map(|a| expand(a, scope)).collect();
    expanded.mounts = task
        .mounts
        .iter()
        .map(|m| {
            let mut m = m.clone();
            m.path = expand(&m.path, scope);
            m
        })
        .collect();
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope<'a>() -> Scope<'a> {
        Scope {
            root_path: "/data/pipelines",
            work_path: "/data/pipelines/sst2",
            run_path: "/data/odin/flow-xyz",
            task_id: "flow-xyz--train",
            task_name: "train",
            pipe_id: "flow-xyz",
        }
    }

    #[test]
    fn expands_run_path_and_task_id() {
        // S5
        let out = expand("--basedir ${RUN_PATH}/${TASK_ID}", &scope());
        assert_eq!(out, "--basedir /data/odin/flow-xyz/flow-xyz--train");
    }

    #[test]
    fn leaves_unknown_variables_untouched() {
        let out = expand("${NOT_A_VAR}/foo", &scope());
        assert_eq!(out, "${NOT_A_VAR}/foo");
    }

    #[test]
    fn expansion_is_idempotent() {
        let once = expand("${TASK_NAME}-${PIPE_ID}", &scope());
        let twice = expand(&once, &scope());
        assert_eq!(once, twice);
    }

    #[test]
    fn expands_each_templated_field_of_a_task() {
        let mut task = TaskDefinition::new("train", "${ROOT_PATH}/train:latest");
        task.args = vec!["--out".into(), "${RUN_PATH}/${TASK_NAME}".into()];
        task.mounts.push(crate::models::pipeline::VolumeMount {
            claim: "data-pvc".into(),
            name: "data".into(),
            path: "${RUN_PATH}/data".into(),
        });

        let expanded = expand_task(&task, &scope());
        assert_eq!(expanded.image, "/data/pipelines/train:latest");
        assert_eq!(expanded.args[1], "/data/odin/flow-xyz/train");
        assert_eq!(expanded.mounts[0].path, "/data/odin/flow-xyz/data");
    }
}
