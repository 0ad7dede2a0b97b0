use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use super::processor::{Persist, Processor};
use super::types::{EventOutcome, InboundEvent};
use crate::actions::ActionRegistry;
use crate::config::EngineSettings;
use crate::error::{ChatFlowError, Result};
use crate::flow::{lint_registry, FlowRegistry, LintFinding, StepKind};
use crate::state::{ContactFlowState, ContactLock, ContactStateStore, SuspensionRecord};
use crate::template::Renderer;

/// 流程执行引擎
///
/// 流程图加载后只读并在所有联系人之间共享；联系人状态存储是唯一的可变共享资源，
/// 同一联系人的事件通过存储提供的排他锁串行处理，不同联系人之间互不阻塞。
pub struct FlowEngine {
    flows: RwLock<Arc<FlowRegistry>>,
    actions: Arc<ActionRegistry>,
    store: Arc<dyn ContactStateStore>,
    renderer: Renderer,
    settings: EngineSettings,
}

impl FlowEngine {
    pub fn new(
        flows: FlowRegistry,
        actions: ActionRegistry,
        store: Arc<dyn ContactStateStore>,
    ) -> Result<Self> {
        Self::with_settings(flows, actions, store, EngineSettings::default())
    }

    pub fn with_settings(
        flows: FlowRegistry,
        actions: ActionRegistry,
        store: Arc<dyn ContactStateStore>,
        settings: EngineSettings,
    ) -> Result<Self> {
        let settings = settings.validated()?;
        check_actions(&flows, &actions)?;
        report_lint(&flows, &actions);
        info!(
            flows = flows.len(),
            step_budget = settings.step_budget,
            "flow engine ready"
        );
        Ok(Self {
            flows: RwLock::new(Arc::new(flows)),
            actions: Arc::new(actions),
            store,
            renderer: Renderer::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// 当前流程注册表快照
    pub fn flows(&self) -> Arc<FlowRegistry> {
        Arc::clone(&*self.flows.read())
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn store(&self) -> &Arc<dyn ContactStateStore> {
        &self.store
    }

    /// 原子替换流程注册表；进行中的联系人在下一个事件时使用新定义
    pub fn reload(&self, flows: FlowRegistry) -> Result<()> {
        check_actions(&flows, &self.actions)?;
        report_lint(&flows, &self.actions);
        info!(flows = flows.len(), "flow registry reloaded");
        *self.flows.write() = Arc::new(flows);
        Ok(())
    }

    pub fn lint(&self) -> Vec<LintFinding> {
        lint_registry(&self.flows(), &self.actions)
    }

    /// 处理单个入站事件
    ///
    /// 动作失败、模板失败与无匹配转移都体现在返回的 [`EventOutcome`] 中；
    /// 只有存储故障与锁超时以 `Err` 返回，由传输层负责重试。
    #[instrument(skip_all, fields(contact = %event.contact_id, kind = event.kind().as_str()))]
    pub async fn handle_event(&self, event: InboundEvent) -> Result<EventOutcome> {
        let lock = self
            .store
            .lock(&event.contact_id, self.settings.lock_timeout())
            .await?;
        let existing = match self.store.load(&lock).await {
            Ok(existing) => existing,
            Err(err) => {
                self.release_quietly(lock).await;
                return Err(err);
            }
        };

        let flows = self.flows();
        let processor = Processor {
            flows: &flows,
            actions: &self.actions,
            renderer: &self.renderer,
            settings: &self.settings,
            store: self.store.as_ref(),
        };
        let (outcome, persist) = match processor.process(&event, existing).await {
            Ok(processed) => processed,
            Err(err) => {
                self.release_quietly(lock).await;
                return Err(err);
            }
        };

        match persist {
            Persist::Unchanged => self.store.release(lock).await?,
            Persist::Save(state) => self.store.commit(lock, Some(&state)).await?,
            Persist::Delete => self.store.commit(lock, None).await?,
        }
        Ok(outcome)
    }

    async fn release_quietly(&self, lock: ContactLock) {
        let contact = lock.contact_id().to_string();
        if let Err(err) = self.store.release(lock).await {
            warn!(contact = %contact, error = %err, "failed to release contact lock");
        }
    }

    /// 托管表单完成回调的便捷入口
    pub async fn complete_form(
        &self,
        contact_id: &str,
        correlation_token: &str,
        field_values: Map<String, Value>,
    ) -> Result<EventOutcome> {
        self.handle_event(InboundEvent::form(contact_id, correlation_token, field_values))
            .await
    }

    /// 并发处理一批事件，最多 `concurrency` 个同时进行
    ///
    /// 结果按完成顺序返回；同一联系人的事件仍由存储锁串行化。
    pub async fn handle_batch(
        &self,
        events: Vec<InboundEvent>,
        concurrency: usize,
    ) -> Vec<Result<EventOutcome>> {
        stream::iter(events)
            .map(|event| self.handle_event(event))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    /// 清理超过 `max_idle` 未更新的联系人，返回被放弃的联系人
    pub async fn abandon_idle(&self, max_idle: Duration) -> Result<Vec<String>> {
        let max_idle = chrono::Duration::from_std(max_idle)
            .map_err(|e| ChatFlowError::Other(anyhow::Error::new(e)))?;
        let cutoff = Utc::now() - max_idle;
        let mut abandoned = Vec::new();
        for contact_id in self.store.idle_contacts(cutoff).await? {
            let lock = self
                .store
                .lock(&contact_id, self.settings.lock_timeout())
                .await?;
            match self.store.load(&lock).await? {
                // 加锁期间可能已有新事件
                Some(state) if state.updated_at < cutoff => {
                    info!(
                        contact = %contact_id,
                        flow = %state.flow_name,
                        step = %state.current_step,
                        "contact abandoned after idle timeout"
                    );
                    self.store.commit(lock, None).await?;
                    abandoned.push(contact_id);
                }
                _ => self.store.release(lock).await?,
            }
        }
        Ok(abandoned)
    }

    pub async fn contact_state(&self, contact_id: &str) -> Result<Option<ContactFlowState>> {
        self.store.peek(contact_id).await
    }

    pub async fn suspension_records(&self, contact_id: &str) -> Result<Vec<SuspensionRecord>> {
        self.store.suspension_records(contact_id).await
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("flows", &self.flows().names())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// 所有 action 步骤引用的动作都必须已注册
fn check_actions(flows: &FlowRegistry, actions: &ActionRegistry) -> Result<()> {
    for flow in flows.list() {
        for step in flow.steps_in_order() {
            if let StepKind::Action(action) = &step.kind {
                for invocation in &action.actions {
                    if !actions.contains(&invocation.action_type) {
                        warn!(
                            flow = %flow.name,
                            step = %step.name,
                            action = %invocation.action_type,
                            "flow uses an unregistered action"
                        );
                        return Err(ChatFlowError::ActionNotRegistered(
                            invocation.action_type.clone(),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

fn report_lint(flows: &FlowRegistry, actions: &ActionRegistry) {
    for finding in lint_registry(flows, actions) {
        warn!(flow = %finding.flow, step = %finding.step, "lint: {}", finding);
    }
}
