// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Failover route management commands.

use prism_domain::{parse_model_backend, FailoverRoute, RoutePolicy, Session};

use super::single_arg;
use crate::parser::Command;
use crate::registry::{CommandContext, CommandHandler, CommandResult};

pub struct CreateFailoverRouteHandler;

impl CommandHandler for CreateFailoverRouteHandler {
    fn name(&self) -> &'static str {
        "create-failover-route"
    }

    fn description(&self) -> &'static str {
        "Create a named failover route with policy k or m"
    }

    fn usage(&self) -> String {
        "create-failover-route(name=<route>, policy=k|m)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let Some(name) = cmd.get("name").filter(|v| !v.is_empty()) else {
            return CommandResult::fail(self.name(), "Route name must be specified");
        };
        let Some(policy_str) = cmd.get("policy").filter(|v| !v.is_empty()) else {
            return CommandResult::fail(self.name(), "Policy must be specified (k or m)");
        };
        let Some(policy) = RoutePolicy::parse(policy_str) else {
            return CommandResult::fail(self.name(), "Policy must be k or m");
        };
        let route = FailoverRoute::new(name, policy);
        let backend_config = session.state.backend_config.with_route(route);
        let state = session.state.with_backend_config(backend_config);
        CommandResult::ok_with_state(
            self.name(),
            format!("Failover route {name} created with policy {policy_str}"),
            state,
        )
    }
}

pub struct DeleteFailoverRouteHandler;

impl CommandHandler for DeleteFailoverRouteHandler {
    fn name(&self) -> &'static str {
        "delete-failover-route"
    }

    fn description(&self) -> &'static str {
        "Delete a named failover route"
    }

    fn usage(&self) -> String {
        "delete-failover-route(name=<route>)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let Some(name) = single_arg(cmd, &["name"]) else {
            return CommandResult::fail(self.name(), "Route name must be specified");
        };
        // Deleting a missing route is silent.
        let backend_config = session.state.backend_config.without_route(name);
        let state = session.state.with_backend_config(backend_config);
        CommandResult::ok_with_state(self.name(), format!("Failover route {name} deleted"), state)
    }
}

pub struct ListFailoverRoutesHandler;

impl CommandHandler for ListFailoverRoutesHandler {
    fn name(&self) -> &'static str {
        "list-failover-routes"
    }

    fn description(&self) -> &'static str {
        "List all failover routes as name:policy"
    }

    fn usage(&self) -> String {
        "list-failover-routes".to_string()
    }

    fn execute(&self, _cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let routes = &session.state.backend_config.failover_routes;
        if routes.is_empty() {
            return CommandResult::ok(self.name(), "No failover routes defined");
        }
        let listing = routes
            .values()
            .map(|r| format!("{}:{}", r.name, r.policy.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        CommandResult::ok(self.name(), listing)
    }
}

/// Shared element insertion for `route-append` / `route-prepend`.
fn insert_element(
    handler_name: &'static str,
    cmd: &Command,
    session: &Session,
    prepend: bool,
) -> CommandResult {
    let Some(name) = cmd.get("name").filter(|v| !v.is_empty()) else {
        return CommandResult::fail(handler_name, "Route name must be specified");
    };
    let Some(element) = cmd.get("element").filter(|v| !v.is_empty()) else {
        return CommandResult::fail(handler_name, "Element must be specified");
    };
    if parse_model_backend(element).is_none() {
        return CommandResult::fail(
            handler_name,
            "Element must have the form backend:model or backend/model",
        );
    }
    let Some(route) = session.state.backend_config.failover_routes.get(name) else {
        return CommandResult::fail(handler_name, format!("Route {name} not found"));
    };
    let mut route = route.clone();
    if prepend {
        route.elements.insert(0, element.to_string());
    } else {
        route.elements.push(element.to_string());
    }
    let backend_config = session.state.backend_config.with_route(route);
    let state = session.state.with_backend_config(backend_config);
    let verb = if prepend { "prepended to" } else { "appended to" };
    CommandResult::ok_with_state(
        handler_name,
        format!("Element {element} {verb} route {name}"),
        state,
    )
}

pub struct RouteAppendHandler;

impl CommandHandler for RouteAppendHandler {
    fn name(&self) -> &'static str {
        "route-append"
    }

    fn description(&self) -> &'static str {
        "Append a backend:model element to a failover route"
    }

    fn usage(&self) -> String {
        "route-append(name=<route>, element=backend:model)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        insert_element(self.name(), cmd, session, false)
    }
}

pub struct RoutePrependHandler;

impl CommandHandler for RoutePrependHandler {
    fn name(&self) -> &'static str {
        "route-prepend"
    }

    fn description(&self) -> &'static str {
        "Prepend a backend:model element to a failover route"
    }

    fn usage(&self) -> String {
        "route-prepend(name=<route>, element=backend:model)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        insert_element(self.name(), cmd, session, true)
    }
}

pub struct RouteClearHandler;

impl CommandHandler for RouteClearHandler {
    fn name(&self) -> &'static str {
        "route-clear"
    }

    fn description(&self) -> &'static str {
        "Remove every element from a failover route"
    }

    fn usage(&self) -> String {
        "route-clear(name=<route>)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let Some(name) = single_arg(cmd, &["name"]) else {
            return CommandResult::fail(self.name(), "Route name must be specified");
        };
        let Some(route) = session.state.backend_config.failover_routes.get(name) else {
            return CommandResult::fail(self.name(), format!("Route {name} not found"));
        };
        let mut route = route.clone();
        route.elements.clear();
        let backend_config = session.state.backend_config.with_route(route);
        let state = session.state.with_backend_config(backend_config);
        CommandResult::ok_with_state(self.name(), format!("Route {name} cleared"), state)
    }
}

pub struct RouteListHandler;

impl CommandHandler for RouteListHandler {
    fn name(&self) -> &'static str {
        "route-list"
    }

    fn description(&self) -> &'static str {
        "List the elements of a failover route in order"
    }

    fn usage(&self) -> String {
        "route-list(name=<route>)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let Some(name) = single_arg(cmd, &["name"]) else {
            return CommandResult::fail(self.name(), "Route name must be specified");
        };
        let Some(route) = session.state.backend_config.failover_routes.get(name) else {
            return CommandResult::fail(self.name(), format!("Route {name} not found"));
        };
        if route.elements.is_empty() {
            return CommandResult::ok(self.name(), format!("Route {name} is empty"));
        }
        CommandResult::ok(self.name(), route.elements.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("test")
    }

    fn ctx() -> CommandContext {
        CommandContext::default()
    }

    fn cmd(name: &str, args: &[(&str, &str)]) -> Command {
        Command {
            name: name.to_string(),
            args: args.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn session_with_route(name: &str, policy: RoutePolicy) -> Session {
        let mut s = session();
        s.state = s.state.with_backend_config(
            s.state.backend_config.with_route(FailoverRoute::new(name, policy)),
        );
        s
    }

    // ── create / delete ───────────────────────────────────────────────────────

    #[test]
    fn create_route_with_valid_policy() {
        let result = CreateFailoverRouteHandler.execute(
            &cmd("create-failover-route", &[("name", "fast"), ("policy", "k")]),
            &session(),
            &ctx(),
        );
        assert!(result.success);
        let state = result.new_state.unwrap();
        assert_eq!(state.backend_config.failover_routes["fast"].policy, RoutePolicy::K);
    }

    #[test]
    fn create_route_rejects_bad_policy() {
        let result = CreateFailoverRouteHandler.execute(
            &cmd("create-failover-route", &[("name", "fast"), ("policy", "x")]),
            &session(),
            &ctx(),
        );
        assert!(!result.success);
        assert_eq!(result.message, "Policy must be k or m");
    }

    #[test]
    fn delete_route_is_silent_on_missing() {
        let result = DeleteFailoverRouteHandler.execute(
            &cmd("delete-failover-route", &[("name", "ghost")]),
            &session(),
            &ctx(),
        );
        assert!(result.success);
    }

    // ── list ──────────────────────────────────────────────────────────────────

    #[test]
    fn list_routes_renders_name_policy_lines() {
        let mut s = session_with_route("alpha", RoutePolicy::K);
        s.state = s.state.with_backend_config(
            s.state.backend_config.with_route(FailoverRoute::new("beta", RoutePolicy::M)),
        );
        let result =
            ListFailoverRoutesHandler.execute(&cmd("list-failover-routes", &[]), &s, &ctx());
        assert_eq!(result.message, "alpha:k\nbeta:m");
    }

    #[test]
    fn list_routes_when_empty() {
        let result = ListFailoverRoutesHandler.execute(
            &cmd("list-failover-routes", &[]),
            &session(),
            &ctx(),
        );
        assert!(result.success);
        assert_eq!(result.message, "No failover routes defined");
    }

    // ── append / prepend / clear / list ───────────────────────────────────────

    #[test]
    fn append_then_prepend_orders_elements() {
        let s = session_with_route("r", RoutePolicy::K);
        let appended = RouteAppendHandler.execute(
            &cmd("route-append", &[("name", "r"), ("element", "openai:gpt-4")]),
            &s,
            &ctx(),
        );
        assert!(appended.success);
        let mut s2 = s.clone();
        s2.state = appended.new_state.unwrap();

        let prepended = RoutePrependHandler.execute(
            &cmd("route-prepend", &[("name", "r"), ("element", "anthropic:claude-3-opus")]),
            &s2,
            &ctx(),
        );
        let state = prepended.new_state.unwrap();
        assert_eq!(
            state.backend_config.failover_routes["r"].elements,
            vec!["anthropic:claude-3-opus", "openai:gpt-4"]
        );
    }

    #[test]
    fn append_validates_element_shape() {
        let s = session_with_route("r", RoutePolicy::K);
        let result = RouteAppendHandler.execute(
            &cmd("route-append", &[("name", "r"), ("element", "just-a-model")]),
            &s,
            &ctx(),
        );
        assert!(!result.success);
        assert!(result.message.contains("backend:model"));
    }

    #[test]
    fn append_to_missing_route_fails() {
        let result = RouteAppendHandler.execute(
            &cmd("route-append", &[("name", "nope"), ("element", "openai:gpt-4")]),
            &session(),
            &ctx(),
        );
        assert!(!result.success);
        assert!(result.message.contains("not found"));
    }

    #[test]
    fn clear_empties_elements() {
        let s = session_with_route("r", RoutePolicy::M);
        let appended = RouteAppendHandler.execute(
            &cmd("route-append", &[("name", "r"), ("element", "openai:gpt-4")]),
            &s,
            &ctx(),
        );
        let mut s2 = s.clone();
        s2.state = appended.new_state.unwrap();
        let cleared = RouteClearHandler.execute(&cmd("route-clear", &[("name", "r")]), &s2, &ctx());
        assert!(cleared.new_state.unwrap().backend_config.failover_routes["r"]
            .elements
            .is_empty());
    }

    #[test]
    fn route_list_prints_elements_in_order() {
        let s = session_with_route("r", RoutePolicy::K);
        let first = RouteAppendHandler.execute(
            &cmd("route-append", &[("name", "r"), ("element", "openai:gpt-4")]),
            &s,
            &ctx(),
        );
        let mut s2 = s.clone();
        s2.state = first.new_state.unwrap();
        let second = RouteAppendHandler.execute(
            &cmd("route-append", &[("name", "r"), ("element", "anthropic:claude-3-opus")]),
            &s2,
            &ctx(),
        );
        s2.state = second.new_state.unwrap();
        let listing = RouteListHandler.execute(&cmd("route-list", &[("name", "r")]), &s2, &ctx());
        assert_eq!(listing.message, "openai:gpt-4\nanthropic:claude-3-opus");
    }
}
