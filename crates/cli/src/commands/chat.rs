//! `parley chat`: interactive chat with streamed answers.

use std::sync::Arc;

use futures::StreamExt;
use parley_agent::Driver;
use parley_config::AppConfig;
use parley_core::{Continuation, Query};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::tools;

const CHAT_INSTRUCTION: &str = "You are a helpful assistant. Use the tools you are given \
when they help; answer in plain text.";

pub async fn run(config: &AppConfig) -> anyhow::Result<()> {
    let llm = parley_providers::create_llm(config)?;
    let registry = tools::chat_registry();
    let query = Query::empty()
        .with_systeminstr(CHAT_INSTRUCTION)
        .with_tools(registry.tool_dict());
    let driver = Driver::new(llm).with_tool_fn(Arc::new(registry));

    println!();
    println!("  Parley chat");
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", config.model_for(&config.default_provider));
    println!("  Type /exit or Ctrl+D to quit.");
    println!();

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    converse(&driver, &query, stdin, &mut stdout).await?;
    println!("  Goodbye!");
    Ok(())
}

/// The read-answer loop over any line source and sink.
///
/// Each turn derives its query from the last successful reply, so a failed
/// turn leaves the conversation where it was.
pub async fn converse<R, W>(
    driver: &Driver,
    base: &Query,
    mut input: R,
    output: &mut W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut current: Box<dyn Continuation> = Box::new(base.streamreplify());
    let mut line = String::new();

    loop {
        output.write_all(b"  You > ").await?;
        output.flush().await?;

        line.clear();
        if input.read_line(&mut line).await? == 0 {
            break;
        }
        let utterance = line.trim();
        if utterance == "/exit" {
            break;
        }
        if utterance.is_empty() {
            continue;
        }

        let query = current.next_query(utterance, &[]).await?;
        let reply = match driver.streamanswer(&query).await {
            Ok(reply) => reply,
            Err(e) => {
                output.write_all(format!("  [Error] {e}\n").as_bytes()).await?;
                continue;
            }
        };

        output.write_all(b"  Assistant > ").await?;
        let mut tokens = reply.stream();
        let mut failed = false;
        while let Some(token) = tokens.next().await {
            match token {
                Ok(token) => {
                    output.write_all(token.as_bytes()).await?;
                    output.flush().await?;
                }
                Err(e) => {
                    output.write_all(format!("\n  [Error] {e}").as_bytes()).await?;
                    failed = true;
                    break;
                }
            }
        }
        output.write_all(b"\n\n").await?;

        if !failed {
            current = Box::new(reply);
        }
    }
    Ok(())
}
