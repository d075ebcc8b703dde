use std::sync::Arc;

use appscope_core::ToolError;
use appscope_core::args::{KustoQueryArgs, RecentFunctionAppsArgs, ToolCall, WhoAmIArgs};
use appscope_core::query::{decode_query, generate_function_apps_query};
use appscope_core::time_range::parse_time_range;
use appscope_core::tools::ToolName;
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::auth::TokenProvider;
use crate::graph::IdentityResolver;
use crate::kusto::{KustoRestEngine, QueryEngine, QueryExecutor};
use crate::util::{EnvSource, ProcessEnv};

/// The three tools. Stateless: every call re-reads configuration and
/// re-acquires tokens.
#[derive(Clone)]
pub struct ToolHandlers {
    identity: IdentityResolver,
    executor: QueryExecutor,
}

impl ToolHandlers {
    pub fn new(env: Arc<dyn EnvSource>, tokens: TokenProvider, engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            identity: IdentityResolver::new(env.clone(), tokens.clone()),
            executor: QueryExecutor::new(env, tokens, engine),
        }
    }

    /// Process environment, default credential chain, REST query engine.
    pub fn from_process_env() -> Self {
        let env: Arc<dyn EnvSource> = Arc::new(ProcessEnv);
        let tokens = TokenProvider::with_default_chain(env.clone());
        Self::new(env, tokens, Arc::new(KustoRestEngine))
    }

    /// Decode and run one call. Failures are logged here before they leave.
    pub async fn invoke(&self, tool: ToolName, args: &Map<String, Value>) -> Result<String, ToolError> {
        let span = tracing::info_span!("tool", tool = %tool);
        let result = async {
            let call = ToolCall::decode(tool, args)?;
            self.dispatch(call).await
        }
        .instrument(span.clone())
        .await;
        if let Err(err) = &result {
            span.in_scope(|| tracing::error!(code = err.code(), "{err}"));
        }
        result
    }

    /// The single string every invocation produces.
    pub async fn invoke_text(&self, tool: ToolName, args: &Map<String, Value>) -> String {
        self.invoke(tool, args)
            .await
            .unwrap_or_else(|err| err.to_string())
    }

    pub async fn dispatch(&self, call: ToolCall) -> Result<String, ToolError> {
        tracing::debug!(tool = %call.tool(), "dispatching tool call");
        match call {
            ToolCall::WhoAmI(args) => self.who_am_i(args).await,
            ToolCall::KustoQuery(args) => self.kusto_query(args).await,
            ToolCall::RecentActiveFunctionApps(args) => self.recent_active_function_apps(args).await,
        }
    }

    async fn who_am_i(&self, args: WhoAmIArgs) -> Result<String, ToolError> {
        self.identity.who_am_i(args.include_email).await
    }

    async fn kusto_query(&self, args: KustoQueryArgs) -> Result<String, ToolError> {
        let query = decode_query(&args.query);
        tracing::debug!(%query, "decoded ad-hoc query");
        self.executor.execute(&query).await
    }

    async fn recent_active_function_apps(
        &self,
        args: RecentFunctionAppsArgs,
    ) -> Result<String, ToolError> {
        let start_time = parse_time_range(args.time_range.as_deref());
        let query = generate_function_apps_query(&start_time, &args.subscription_id, args.limit);
        tracing::info!(
            %start_time,
            subscription_id = %args.subscription_id,
            limit = args.limit,
            "Querying recently active function apps"
        );
        self.executor.execute(&query).await
    }
}
