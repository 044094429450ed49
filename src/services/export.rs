use crate::config::APP_NAME;
use crate::models::{Conversation, Message, Role};

pub fn export_to_markdown(conversation: &Conversation, messages: &[Message]) -> String {
    let mut output = format!("# {}\n\n", conversation.title);
    output.push_str(&format!(
        "> Criada em: {} | Atualizada em: {}\n\n",
        conversation.created_at.format("%Y-%m-%d %H:%M"),
        conversation.updated_at.format("%Y-%m-%d %H:%M")
    ));

    output.push_str("---\n\n");

    for msg in messages {
        let role_label = match msg.role {
            Role::User => "Você",
            Role::Assistant => APP_NAME,
        };
        output.push_str(&format!("### {}\n\n{}\n\n", role_label, msg.content));
    }

    output
}
