use crate::diagnostics::RenderDiagnostic;

pub const SYSTEM_INSTRUCTION: &str = "You are a Manim code generator that ONLY outputs executable Python code.
IMPORTANT INSTRUCTIONS:
1. Return ONLY Python code - no explanations, no thinking, no markdown
2. Include all necessary imports (from manim import *)
3. Create a Scene class named 'MainScene' with proper construct method
4. Follow exact Manim syntax and conventions
5. Do not include main blocks or code fences (```)
6. Ensure animations work correctly with proper syntax
7. Do not output ANY text that isn't part of the final code
8. Consider the entire conversation history to maintain context";

pub const FIX_INSTRUCTION: &str = "You repair Manim Python scripts that failed to render.
Return the complete corrected script and nothing else: no explanations, no markdown.
Keep the Scene class named 'MainScene' and keep the animation the user asked for.";

pub const CODE_ONLY_REMINDER: &str = "Your previous answer did not contain a Manim Scene class. \
Reply with the complete Python script only, starting with `from manim import *` and \
defining `class MainScene(Scene)` with a `construct` method.";

pub fn fix_prompt(code: &str, diagnostic: &RenderDiagnostic) -> String {
    let mut prompt = format!(
        "Fix the following Manim Python code that produced this error:\n\nError Type: {}\nError Message: {}\n",
        diagnostic.error_type.as_deref().unwrap_or("Unknown"),
        diagnostic.message,
    );

    if let Some(line) = diagnostic.line {
        prompt.push_str(&format!("Error Line: {}\n", line));
    }
    if let Some(context) = diagnostic.context.as_deref() {
        prompt.push_str(&format!("\nError Context:\n{}\n", context));
    }
    if diagnostic.error_type.is_none() && !diagnostic.raw.is_empty() {
        prompt.push_str(&format!("\nRenderer Output:\n{}\n", diagnostic.raw));
    }

    prompt.push_str(&format!("\nCode to fix:\n```python\n{}\n```\n", code));
    prompt.push_str("\nPlease provide only the fixed code without explanations.");
    prompt
}
