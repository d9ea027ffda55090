//! A backend played by a person at the terminal.
//!
//! Each step prints the query and asks what the "model" should answer:
//! a text or a list of tool calls. Handy for walking an application through
//! a conversation without spending tokens.

use async_trait::async_trait;
use parley_core::{
    BackendDefaults, Error, Llm, ParamValues, Pretty, Query, Reply, Result, SingleToolCall, StepParams,
    StreamingReply, StreamingTextReply, StreamingToolCallsReply, TextReply, ToolCallsReply,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

type Input = Box<dyn AsyncBufRead + Send + Unpin>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Typed at any prompt to go back to the reply kind choice.
const RESTART: &str = "/";
/// Ends a list of arguments or of tool calls.
const FINISH: &str = ".";

struct Console {
    input: Input,
    output: Output,
    next_call_id: u64,
}

enum Answer {
    Text(String),
    Calls(Vec<SingleToolCall>),
}

impl Console {
    async fn say(&mut self, text: &str) -> Result<()> {
        self.output
            .write_all(text.as_bytes())
            .await
            .map_err(io_error)?;
        self.output.flush().await.map_err(io_error)
    }

    /// Print a prompt and read one line without its line ending.
    async fn ask(&mut self, prompt: &str) -> Result<String> {
        self.say(prompt).await?;
        let mut line = String::new();
        let read = self.input.read_line(&mut line).await.map_err(io_error)?;
        if read == 0 {
            return Err(Error::Transport("input closed".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn choose(&mut self) -> Result<String> {
        loop {
            let choice = self
                .ask("What kind of reply do you want to create?\n\t1 => text reply\n\t2 => tool calls reply\n")
                .await?;
            match choice.trim() {
                "1" | "2" => return Ok(choice.trim().to_string()),
                _ => self.say("Only 1 and 2 are acceptable answers.\n").await?,
            }
        }
    }

    /// Read arguments until `.`; `None` means restart.
    async fn arguments(&mut self) -> Result<Option<ParamValues>> {
        let mut args = ParamValues::new();
        let mut prompt = "Enter name of first argument, '.' to finish the list of arguments or '/' to restart: ";
        loop {
            let name = self.ask(prompt).await?.trim().to_string();
            prompt = "Enter name of next argument, '.' to finish the list of arguments or '/' to restart: ";
            match name.as_str() {
                RESTART => return Ok(None),
                FINISH => return Ok(Some(args)),
                _ if args.contains_key(&name) => {
                    self.say(&format!("Argument '{name}' already set, entry ignored.\n"))
                        .await?;
                }
                _ => {
                    let value = self.ask(&format!("Enter value for argument '{name}': ")).await?;
                    args.insert(name, value);
                }
            }
        }
    }

    /// Read tool calls until `.`; `None` means restart.
    async fn calls(&mut self) -> Result<Option<Vec<SingleToolCall>>> {
        let mut calls = Vec::new();
        let mut prompt = "Enter the name of the first tool to be called or '/' to restart: ";
        loop {
            let name = self.ask(prompt).await?.trim().to_string();
            prompt = "Enter the name of the next tool to be called, '.' to finish or '/' to restart: ";
            match name.as_str() {
                RESTART => return Ok(None),
                FINISH if !calls.is_empty() => return Ok(Some(calls)),
                FINISH => self.say("At least one call is needed.\n").await?,
                _ => {
                    let Some(args) = self.arguments().await? else {
                        return Ok(None);
                    };
                    let call_id = self.next_call_id.to_string();
                    self.next_call_id += 1;
                    calls.push(SingleToolCall::new(call_id, name, args));
                }
            }
        }
    }

    async fn answer(&mut self) -> Result<Answer> {
        loop {
            if self.choose().await? == "1" {
                let text = self
                    .ask("Please enter textual reply or '/' to restart: ")
                    .await?;
                if text.trim() == RESTART {
                    continue;
                }
                return Ok(Answer::Text(text));
            }
            if let Some(calls) = self.calls().await? {
                return Ok(Answer::Calls(calls));
            }
        }
    }
}

fn io_error(e: std::io::Error) -> Error {
    Error::Transport(format!("console I/O failed: {e}"))
}

pub struct ManualLlm {
    console: Mutex<Console>,
    defaults: BackendDefaults,
}

impl ManualLlm {
    pub fn new(
        input: impl AsyncBufRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            console: Mutex::new(Console {
                input: Box::new(input),
                output: Box::new(output),
                next_call_id: 0,
            }),
            defaults: BackendDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: BackendDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Plays the model on the process's own terminal.
    ///
    /// Reads stdin through its own buffer, so it is meant for a terminal.
    /// Piped input shared with another stdin reader may be consumed by
    /// whichever reader buffers it first.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }

    async fn interact(&self, kind: &str, query: &Query, params: &StepParams) -> Result<Answer> {
        let mut console = self.console.lock().await;
        let header = format!(
            "ManualLlm.{kind} invoked with temperature = {}, model = {}, extra = {:?} and query =\n",
            params.temperature, params.model, params.extra
        );
        console.say(&header).await?;
        let mut rendered = String::new();
        query.pretty("  ", &mut rendered);
        console.say(&rendered).await?;
        console.answer().await
    }
}

#[async_trait]
impl Llm for ManualLlm {
    fn name(&self) -> &str {
        "manual"
    }

    fn defaults(&self) -> BackendDefaults {
        self.defaults.clone()
    }

    async fn step(&self, query: &Query, params: &StepParams) -> Result<Reply> {
        Ok(match self.interact("step", query, params).await? {
            Answer::Text(text) => TextReply::new(query.clone(), text).into(),
            Answer::Calls(calls) => ToolCallsReply::new(query.clone(), calls).into(),
        })
    }

    async fn streamstep(&self, query: &Query, params: &StepParams) -> Result<StreamingReply> {
        Ok(match self.interact("streamstep", query, params).await? {
            Answer::Text(text) => {
                StreamingReply::Text(StreamingTextReply::of_text(query.clone(), &text))
            }
            Answer::Calls(calls) => {
                StreamingReply::ToolCalls(StreamingToolCallsReply::of_calls(query.clone(), calls))
            }
        })
    }
}
