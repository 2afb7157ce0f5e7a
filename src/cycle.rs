use crate::{
    agent::{AgentRunner, Tool},
    config::Config,
    llm::ModelClient,
    mcp::{McpSession, McpTool},
    scheduler::Cycle,
    telemetry::Metrics,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::{sync::Arc, time::Instant};

const GOAL: &str = "Monitor the security cameras and report the current situation to the \
                    recipient in every situation, whether the activity is normal or suspicious.";

pub fn render_instructions(config: &Config, now: DateTime<Local>) -> String {
    let mut out = String::new();
    out.push_str(
        "You are a security camera monitoring agent. Analyze the camera frames for \
         suspicious activity and report the current situation through the messaging \
         tools every time, whether it is normal or suspicious.\n",
    );

    out.push_str("Capture one frame from each camera with the capture_frame tool:\n");
    for camera in config.cameras.all() {
        out.push_str(&format!(
            "- {}: stream_url `{}`, image_path `{}`\n",
            camera.name,
            camera.stream_url,
            camera.frame_path.display()
        ));
    }

    out.push_str(&format!(
        "The recipient is '{}'. Write a detailed but concise message summarizing the key \
         findings for each room.\n",
        config.notification.recipient
    ));
    out.push_str(&format!(
        "The current local time is {}.\n",
        now.format("%A %d %B %Y %H:%M:%S %:z")
    ));
    out.push_str(
        "Use exactly this format:\n\
         Alarm Triggered: [yes/no] (add an emoji if yes)\n\
         Date/Time: [detailed date and time]\n\
         Room [Room Name] (appropriate emoji): [detailed description of the room]\n",
    );

    let paths = config
        .cameras
        .all()
        .iter()
        .map(|camera| camera.frame_path.display().to_string())
        .collect::<Vec<_>>()
        .join(" and ");
    out.push_str(&format!(
        "If there is suspicious activity, also send the camera media stored in {}.\n",
        paths
    ));
    out.push_str(
        "Do not ask for confirmation or permission. Send the message as soon as your \
         judgment is complete.",
    );
    out
}

pub struct MonitoringCycle<M: ModelClient> {
    config: Arc<Config>,
    runner: AgentRunner<M>,
    capture_tool: Arc<dyn Tool>,
    metrics: Arc<Metrics>,
}

impl<M: ModelClient> MonitoringCycle<M> {
    pub fn new(
        config: Arc<Config>,
        runner: AgentRunner<M>,
        capture_tool: Arc<dyn Tool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            runner,
            capture_tool,
            metrics,
        }
    }

    async fn run_once(&self) -> anyhow::Result<String> {
        tracing::info!("Starting new monitoring cycle...");
        let session = Arc::new(
            McpSession::connect(&self.config.messaging)
                .await
                .context("failed to start the messaging tool server")?,
        );

        let outcome = self.run_agent(&session).await;
        session.close().await;

        let output = outcome?;
        tracing::info!("Cycle finished. Agent output: {}", output);
        Ok(output)
    }

    async fn run_agent(&self, session: &Arc<McpSession>) -> anyhow::Result<String> {
        let remote_tools = session
            .list_tools()
            .await
            .context("failed to list messaging tools")?;
        tracing::debug!("Messaging server offers {} tool(s)", remote_tools.len());

        let mut tools: Vec<Arc<dyn Tool>> = vec![self.capture_tool.clone()];
        tools.extend(
            remote_tools
                .into_iter()
                .map(|tool| Arc::new(McpTool::new(session.clone(), tool)) as Arc<dyn Tool>),
        );

        let instructions = render_instructions(&self.config, Local::now());
        let run = self
            .runner
            .run(&instructions, GOAL, &tools)
            .await
            .context("agent run failed")?;
        tracing::info!(
            "Agent finished after {} turn(s) and {} tool call(s)",
            run.turns,
            run.tool_calls
        );
        Ok(run.final_output)
    }
}

#[async_trait]
impl<M: ModelClient> Cycle for MonitoringCycle<M> {
    async fn run(&self) -> anyhow::Result<String> {
        let start = Instant::now();
        let result = self.run_once().await;
        let outcome = if result.is_ok() { "ok" } else { "failed" };
        self.metrics
            .record_cycle(start.elapsed().as_millis() as u64, outcome);
        result
    }
}
