use th_core::types::{Event, EventType};

use super::Workspace;

pub async fn run(
    ws: &Workspace,
    event_type: Option<EventType>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let events = ws.board.store().list_events(event_type, limit).await?;
    if events.is_empty() && !json {
        println!("No events.");
        return Ok(());
    }
    for event in &events {
        if json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!("{}", render_line(event));
        }
    }
    Ok(())
}

pub fn render_line(event: &Event) -> String {
    let mut line = format!(
        "{} {:<22}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.event_type.as_str()
    );
    for (label, value) in [
        ("group", &event.group_id),
        ("task", &event.task_id),
        ("agent", &event.agent_id),
    ] {
        if let Some(value) = value {
            line.push_str(&format!(" {label}={value}"));
        }
    }
    if !event.payload.is_null() && event.payload != serde_json::json!({}) {
        line.push_str(&format!(" {}", event.payload));
    }
    line.trim_end().to_string()
}
