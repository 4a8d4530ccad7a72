// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use prism_domain::Session;

use crate::parser::Command;
use crate::registry::{CommandContext, CommandHandler, CommandResult};

pub struct HelloHandler;

impl CommandHandler for HelloHandler {
    fn name(&self) -> &'static str {
        "hello"
    }

    fn description(&self) -> &'static str {
        "Request a greeting and session banner from the proxy"
    }

    fn usage(&self) -> String {
        "hello".to_string()
    }

    fn execute(&self, _cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let state = session.state.with_hello_requested(true);
        CommandResult::ok_with_state(self.name(), "Hello! prism is at your service.", state)
    }
}

pub struct PwdHandler;

impl CommandHandler for PwdHandler {
    fn name(&self) -> &'static str {
        "pwd"
    }

    fn description(&self) -> &'static str {
        "Print the current project directory."
    }

    fn usage(&self) -> String {
        "pwd".to_string()
    }

    fn execute(&self, _cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        match &session.state.project_dir {
            Some(dir) => CommandResult::ok(self.name(), dir.clone()),
            None => CommandResult::fail(self.name(), "Project directory not set."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(name: &str) -> Command {
        Command { name: name.to_string(), args: Vec::new() }
    }

    #[test]
    fn hello_sets_flag_and_greets() {
        let session = Session::new("s");
        let result = HelloHandler.execute(&cmd("hello"), &session, &CommandContext::default());
        assert!(result.success);
        assert!(result.new_state.unwrap().hello_requested);
        assert!(result.message.contains("Hello"));
    }

    #[test]
    fn pwd_reports_directory_when_set() {
        let mut session = Session::new("s");
        session.state = session.state.with_project_dir(Some("/work/acme".into()));
        let result = PwdHandler.execute(&cmd("pwd"), &session, &CommandContext::default());
        assert!(result.success);
        assert_eq!(result.message, "/work/acme");
    }

    #[test]
    fn pwd_fails_when_unset() {
        let session = Session::new("s");
        let result = PwdHandler.execute(&cmd("pwd"), &session, &CommandContext::default());
        assert!(!result.success);
        assert_eq!(result.message, "Project directory not set.");
    }
}
