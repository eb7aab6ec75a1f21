//! System prompt rendering.

use std::fmt::Write;

use crate::tools::{SideEffect, ToolDefinition, ToolRegistry};

const BASE_PROMPT: &str = "\
You are Drover, a software engineering agent working inside the user's project.
Work step by step. Use one or more tools per response when you need information \
or need to change files, then wait for their results before continuing.
When the task is complete, answer without using any tool.";

const TOOL_SYNTAX: &str = "\
Invoke a tool by writing an XML-style block whose tag is the tool name and \
whose children are the parameters:

<tool_name>
<parameter_name>value</parameter_name>
</tool_name>

Parameter values are raw text; do not escape them. Tools that only read run \
concurrently. A tool that modifies files runs after every earlier tool has \
finished. Results come back in a user message as <tool_result> blocks in the \
order the tools were written.";

/// Render the full system prompt for `registry`.
#[must_use]
pub fn render_system_prompt(registry: &ToolRegistry) -> String {
    render(&registry.definitions())
}

fn render(definitions: &[ToolDefinition]) -> String {
    let mut buf = String::with_capacity(2048);
    buf.push_str(BASE_PROMPT);
    if definitions.is_empty() {
        return buf;
    }
    let _ = write!(buf, "\n\n# Tool use\n\n{TOOL_SYNTAX}\n\n# Tools\n");
    for def in definitions {
        let _ = write!(buf, "\n## {}\n{}\n", def.name, def.description);
        if def.side_effect == SideEffect::Mutating {
            buf.push_str("Modifies the workspace.\n");
        }
        buf.push_str("Parameters:\n");
        for param in &def.parameters {
            let _ = writeln!(
                buf,
                "- {} ({}): {}",
                param.name,
                if param.required { "required" } else { "optional" },
                param.description
            );
        }
    }
    buf.truncate(buf.trim_end().len());
    buf
}
