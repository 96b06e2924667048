//! Template expansion: a template file with `[%warden ... %]` markers is
//! turned into a temporary `edit_line` bundle of `insert_lines` promises,
//! one per guarded block, which the ordinary edit driver then keeps.

use tracing::debug;

use super::{EditError, EditResult};
use crate::eval::classes::{canonify, is_defined_class};
use crate::eval::EvalContext;
use crate::policy::{BundleId, Policy, Rval, DEFAULT_NAMESPACE};

const MARKER_PREFIX: &str = "[%warden";
const MARKER_SUFFIX: &str = "%]";

/// Build a temporary `edit_line` bundle from template text. Literal lines
/// between `BEGIN` and `END` markers become one multi-line promise guarded
/// by the innermost `name::` context; loose lines become one promise each.
pub fn make_template_bundle(
    policy: &mut Policy,
    ctx: &EvalContext,
    template_text: &str,
    template_path: &str,
) -> EditResult<BundleId> {
    let bundle_name = format!("template_{}", canonify(template_path));
    let bundle_id = policy.append_bundle(
        DEFAULT_NAMESPACE,
        &bundle_name,
        "edit_line",
        vec![],
        Some(template_path.to_string()),
    );
    let section = policy.append_section(bundle_id, "insert_lines");

    let syntax_error = |line: usize, reason: &str| EditError::TemplateSyntax {
        path: template_path.to_string(),
        line,
        reason: reason.to_string(),
    };

    let mut context = "any".to_string();
    let mut context_stack: Vec<String> = Vec::new();
    let mut block_lines: Vec<&str> = Vec::new();
    let mut depth = 0usize;

    for (line_number, raw_line) in template_text.lines().enumerate() {
        let line_number = line_number + 1;

        if let Some(rest) = raw_line.trim_start().strip_prefix(MARKER_PREFIX) {
            let mut words = rest.split_whitespace();
            let op = words
                .next()
                .ok_or_else(|| syntax_error(line_number, "empty template marker"))?;
            if words.next() != Some(MARKER_SUFFIX) {
                return Err(syntax_error(line_number, "missing closing \"%]\""));
            }

            match op {
                "BEGIN" => {
                    context_stack.push(context.clone());
                    depth += 1;
                    if depth > 1 {
                        return Err(syntax_error(line_number, "nested blocks are not allowed"));
                    }
                }
                "END" => {
                    if depth == 0 {
                        return Err(syntax_error(line_number, "END without BEGIN"));
                    }
                    depth -= 1;
                    if let Some(outer) = context_stack.pop() {
                        let block_context = context.clone();
                        context = outer;
                        if !block_lines.is_empty() {
                            let promiser = block_lines.join("\n");
                            debug!(
                                guard = %block_context,
                                lines = block_lines.len(),
                                "template block promise"
                            );
                            let promise =
                                policy.append_promise(section, &promiser, None, &block_context);
                            policy.promise_mut(promise).offset.line = line_number;
                            policy.append_promise_constraint(
                                promise,
                                "insert_type",
                                Rval::scalar("preserve_all_lines"),
                                false,
                            );
                            block_lines.clear();
                        }
                    }
                }
                word if word.ends_with("::") => {
                    context = word.trim_end_matches(':').to_string();
                }
                other => {
                    return Err(syntax_error(
                        line_number,
                        &format!("unknown template operator '{other}'"),
                    ));
                }
            }
            continue;
        }

        if !is_defined_class(ctx, &context) {
            continue;
        }
        if depth > 0 {
            block_lines.push(raw_line);
        } else {
            let promise = policy.append_promise(section, raw_line, None, &context);
            policy.promise_mut(promise).offset.line = line_number;
            policy.append_promise_constraint(
                promise,
                "insert_type",
                Rval::scalar("preserve_all_lines"),
                false,
            );
        }
    }

    if depth > 0 {
        return Err(syntax_error(
            template_text.lines().count(),
            "unterminated BEGIN block",
        ));
    }

    Ok(bundle_id)
}
