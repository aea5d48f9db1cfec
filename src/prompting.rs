use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub company_name: &'a str,
    pub bot_name: &'a str,
    pub teams_block: &'a str,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            company_name => display_or(ctx.company_name, "the company"),
            bot_name => display_or(ctx.bot_name, "Support Bot"),
            teams_block => ctx.teams_block,
            has_teams => !ctx.teams_block.trim().is_empty(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value.trim()
    }
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are {} for \"{}\".\n\
         Answer the customer's question accurately and concisely. Never invent facts.\n\
         Respond with a single JSON object: {{\"answered\": bool, \"reply\": string, \
         \"redirectTeamId\": string, \"redirectTeamName\": string, \"suggestions\": [string]}}.\n",
        display_or(ctx.bot_name, "Support Bot"),
        display_or(ctx.company_name, "the company"),
    );

    if !ctx.teams_block.trim().is_empty() {
        prompt.push_str("\nTeams available for redirect:\n");
        prompt.push_str(ctx.teams_block.trim());
        prompt.push('\n');
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_prompt_mentions_teams_when_present() {
        let prompt = render_system_prompt(&SystemPromptContext {
            company_name: "Acme",
            bot_name: "",
            teams_block: "- billing (id: t1)",
        });
        assert!(prompt.contains("Acme"));
        assert!(prompt.contains("Support Bot"));
        assert!(prompt.contains("billing"));
    }

    #[test]
    fn rendered_prompt_omits_team_section_when_empty() {
        let prompt = render_system_prompt(&SystemPromptContext {
            company_name: "Acme",
            bot_name: "Ava",
            teams_block: "",
        });
        assert!(!prompt.contains("escalations"));
        assert!(prompt.contains("Ava"));
    }
}
