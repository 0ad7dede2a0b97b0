// 单个入站事件的处理：会话定位、问题应答、步骤推进与挂起恢复

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::question;
use super::suspension::{self, PendingForm};
use super::types::{
    EventDisposition, EventOutcome, EventPayload, FormCompletion, HaltReason, InboundEvent,
    OutboundIntent,
};
use crate::actions::payment::cancel_patch;
use crate::actions::{ActionCall, ActionRegistry, ExternalCallRequest, FlowSwitchRequest, PaymentState};
use crate::config::EngineSettings;
use crate::error::{ChatFlowError, Result};
use crate::flow::constants::{context_keys, defaults};
use crate::flow::{
    ActionStep, ConditionEvaluator, Flow, FlowRegistry, MessageSpec, QuestionStep, Step, StepKind,
};
use crate::state::{
    ContactFlowState, ContactStateStore, FlowStatus, SuspensionKind, SuspensionRecord,
};
use crate::template::{RenderScope, Renderer};

/// 处理完成后对状态行的操作
#[derive(Debug)]
pub(crate) enum Persist {
    Unchanged,
    Save(ContactFlowState),
    Delete,
}

/// 推进循环的下一动作
enum Next {
    /// 进入步骤（消耗一次步骤预算）
    Enter(String),
    /// 针对当前事件求值该步骤的转移
    Evaluate(String),
    Stop,
}

/// 一次推进过程中的可变状态
struct Run<'e> {
    state: ContactFlowState,
    flow: Arc<Flow>,
    event: &'e InboundEvent,
    outcome: EventOutcome,
}

impl<'e> Run<'e> {
    fn new(state: ContactFlowState, flow: Arc<Flow>, event: &'e InboundEvent) -> Self {
        let outcome = EventOutcome::new(&state.contact_id, EventDisposition::Processed);
        Self {
            state,
            flow,
            event,
            outcome,
        }
    }

    fn scope(&self) -> RenderScope<'_> {
        scope(&self.state, self.event)
    }

    fn send(&mut self, message: MessageSpec) {
        self.outcome
            .outbound
            .push(OutboundIntent::new(&self.state.contact_id, message));
    }

    /// 在当前步骤中止：记录原因并给用户一条通用提示
    fn halt(&mut self, reason: HaltReason, text: &str) -> Next {
        self.send(MessageSpec::text(text));
        self.outcome.halt = Some(reason);
        Next::Stop
    }

    fn finish(mut self) -> (EventOutcome, Persist) {
        self.state.touch();
        describe(&mut self.outcome, &self.state);
        if self.state.status == FlowStatus::Terminated {
            (self.outcome, Persist::Delete)
        } else {
            (self.outcome, Persist::Save(self.state))
        }
    }
}

fn scope<'s>(state: &'s ContactFlowState, event: &InboundEvent) -> RenderScope<'s> {
    RenderScope::new(&state.context)
        .with_contact(&state.contact_id, event.contact_name.as_deref())
        .with_message(event.summary())
}

fn describe(outcome: &mut EventOutcome, state: &ContactFlowState) {
    outcome.flow_name = Some(state.flow_name.clone());
    outcome.current_step = Some(state.current_step.clone());
    outcome.status = Some(state.status);
}

fn record_event(state: &mut ContactFlowState, event: &InboundEvent) {
    state
        .context
        .insert(context_keys::LAST_EVENT, event.summary());
    if let Some(event_id) = &event.event_id {
        state
            .context
            .insert(context_keys::LAST_EVENT_ID, Value::from(event_id.as_str()));
    }
}

pub(crate) struct Processor<'a> {
    pub(crate) flows: &'a FlowRegistry,
    pub(crate) actions: &'a ActionRegistry,
    pub(crate) renderer: &'a Renderer,
    pub(crate) settings: &'a EngineSettings,
    pub(crate) store: &'a dyn ContactStateStore,
}

impl<'a> Processor<'a> {
    pub(crate) async fn process(
        &self,
        event: &InboundEvent,
        existing: Option<ContactFlowState>,
    ) -> Result<(EventOutcome, Persist)> {
        if let (Some(state), Some(event_id)) = (&existing, &event.event_id) {
            let last = state
                .context
                .get(context_keys::LAST_EVENT_ID)
                .and_then(Value::as_str);
            if last == Some(event_id.as_str()) {
                info!(contact = %event.contact_id, event_id = %event_id, "duplicate event ignored");
                let mut outcome = EventOutcome::new(&event.contact_id, EventDisposition::Duplicate);
                describe(&mut outcome, state);
                return Ok((outcome, Persist::Unchanged));
            }
        }

        if let EventPayload::FormResponse(completion) = &event.payload {
            return self.complete_form(event, completion, existing).await;
        }

        let mut stale = false;
        let active = existing.and_then(|state| match self.locate(&state) {
            Some(flow) => Some((state, flow)),
            None => {
                stale = true;
                None
            }
        });

        let Some((state, flow)) = active else {
            return match self.trigger(event) {
                Some(target) => self.start(event, target).await,
                None => {
                    debug!(contact = %event.contact_id, "no active flow and no trigger matched");
                    let outcome = EventOutcome::new(&event.contact_id, EventDisposition::Idle);
                    let persist = if stale { Persist::Delete } else { Persist::Unchanged };
                    Ok((outcome, persist))
                }
            };
        };

        let current = Arc::clone(&flow);
        let Some(step) = current.step(&state.current_step) else {
            return Err(ChatFlowError::UnknownStep {
                flow: state.flow_name.clone(),
                step: state.current_step.clone(),
            });
        };
        match &step.kind {
            StepKind::ExternalForm(form) => {
                if let Some(target) = self.trigger(event) {
                    info!(
                        contact = %event.contact_id,
                        flow = %state.flow_name,
                        step = %step.name,
                        "form abandoned for a new trigger"
                    );
                    return self.start(event, target).await;
                }
                let mut outcome =
                    EventOutcome::new(&event.contact_id, EventDisposition::AwaitingForm);
                let reminder = form
                    .reminder_message_text
                    .as_deref()
                    .or(self.settings.form_reminder_text.as_deref());
                if let Some(reminder) = reminder {
                    let body = self
                        .renderer
                        .render(reminder, &scope(&state, event))
                        .unwrap_or_else(|_| reminder.to_string());
                    outcome
                        .outbound
                        .push(OutboundIntent::new(&event.contact_id, MessageSpec::text(body)));
                }
                describe(&mut outcome, &state);
                Ok((outcome, Persist::Unchanged))
            }
            StepKind::Question(question) if state.is_awaiting() => {
                self.answer(event, state, flow, step, question).await
            }
            _ => {
                if let Some(target) = self.trigger(event) {
                    return self.start(event, target).await;
                }
                let mut state = state;
                record_event(&mut state, event);
                let run = Run::new(state, flow, event);
                self.drive(run, Next::Evaluate(step.name.clone())).await
            }
        }
    }

    /// 状态所指的流程与步骤仍然存在
    fn locate(&self, state: &ContactFlowState) -> Option<Arc<Flow>> {
        let flow = self.flows.get(&state.flow_name);
        match &flow {
            Some(flow) if flow.step(&state.current_step).is_some() => {
                if flow.version != state.flow_version {
                    debug!(
                        contact = %state.contact_id,
                        flow = %flow.name,
                        from = state.flow_version,
                        to = flow.version,
                        "contact continues on a newer flow version"
                    );
                }
            }
            _ => {
                warn!(
                    contact = %state.contact_id,
                    flow = %state.flow_name,
                    step = %state.current_step,
                    "flow or step no longer defined, resetting contact"
                );
                return None;
            }
        }
        flow
    }

    fn trigger(&self, event: &InboundEvent) -> Option<Arc<Flow>> {
        event
            .text_body()
            .and_then(|text| self.flows.match_trigger(text))
    }

    async fn start(&self, event: &InboundEvent, flow: Arc<Flow>) -> Result<(EventOutcome, Persist)> {
        info!(contact = %event.contact_id, flow = %flow.name, "flow triggered");
        let mut state =
            ContactFlowState::new(&event.contact_id, &flow.name, flow.version, &flow.entry);
        record_event(&mut state, event);
        let entry = flow.entry.clone();
        let run = Run::new(state, flow, event);
        self.drive(run, Next::Enter(entry)).await
    }

    /// 处理停在 question 步骤时收到的回复
    async fn answer(
        &self,
        event: &InboundEvent,
        mut state: ContactFlowState,
        flow: Arc<Flow>,
        step: &Step,
        question: &QuestionStep,
    ) -> Result<(EventOutcome, Persist)> {
        record_event(&mut state, event);

        let awaiting_otp = PaymentState::from_context(&state.context)
            .map(|payment| payment.is_awaiting_otp())
            .unwrap_or(false);
        if awaiting_otp {
            if let Some(text) = event.text_body() {
                if self.settings.is_cancel_keyword(text) {
                    return self.cancel_payment(Run::new(state, flow, event), question).await;
                }
            }
        }

        if let Some(value) = question::accept(question, event) {
            question::reset_retries(&mut state.context);
            state.context.set_path(&question.save_to, value);
            let run = Run::new(state, flow, event);
            return self.drive(run, Next::Evaluate(step.name.clone())).await;
        }

        let attempts = question::retries(&state.context, &step.name) + 1;
        let mut run = Run::new(state, flow, event);
        if attempts <= question.fallback.max_retries {
            question::set_retries(&mut run.state.context, &step.name, attempts);
            debug!(
                contact = %run.state.contact_id,
                step = %step.name,
                attempts,
                "invalid reply, re-prompting"
            );
            let text = question
                .fallback
                .re_prompt_message_text
                .as_deref()
                .unwrap_or(defaults::RE_PROMPT_TEXT);
            let rendered = self.renderer.render(text, &run.scope());
            match rendered {
                Ok(body) => run.send(MessageSpec::text(body)),
                Err(err) => {
                    let reason = HaltReason::TemplateFailed {
                        step: step.name.clone(),
                        message: err.to_string(),
                    };
                    run.halt(reason, &self.settings.generic_error_text);
                }
            }
            run.outcome.disposition = EventDisposition::Reprompted;
            return Ok(run.finish());
        }

        question::reset_retries(&mut run.state.context);
        if let Some(target) = &question.fallback.fallback_step {
            info!(
                contact = %run.state.contact_id,
                step = %step.name,
                fallback = %target,
                "retries exhausted, moving to fallback step"
            );
            return self.drive(run, Next::Enter(target.clone())).await;
        }

        warn!(
            contact = %run.state.contact_id,
            flow = %run.state.flow_name,
            step = %step.name,
            "retries exhausted, handing over to a human"
        );
        let text = question
            .fallback
            .handover_message_text
            .as_deref()
            .unwrap_or(self.settings.handover_text.as_str());
        let body = self
            .renderer
            .render(text, &run.scope())
            .unwrap_or_else(|_| self.settings.handover_text.clone());
        run.send(MessageSpec::text(body));
        run.outcome.external_calls.push(ExternalCallRequest::HumanHandover {
            contact_id: run.state.contact_id.clone(),
            flow: run.state.flow_name.clone(),
            step: step.name.clone(),
            reason: Some(format!("no valid reply after {} attempts", attempts)),
        });
        run.state.status = FlowStatus::Terminated;
        Ok(run.finish())
    }

    /// OTP 取消关键字：撤销支付且不调用确认接口
    async fn cancel_payment(
        &self,
        mut run: Run<'_>,
        question: &QuestionStep,
    ) -> Result<(EventOutcome, Persist)> {
        info!(
            contact = %run.state.contact_id,
            flow = %run.state.flow_name,
            step = %run.state.current_step,
            "payment cancelled by contact"
        );
        let result = cancel_patch(&run.state.contact_id, &run.state.context)?;
        run.state.context.apply_patch(&result.context_patch);
        run.outcome.external_calls.extend(result.external_calls);
        question::reset_retries(&mut run.state.context);

        let cancel_step = question.otp.as_ref().and_then(|otp| otp.cancel_step.clone());
        match cancel_step {
            Some(target) => self.drive(run, Next::Enter(target)).await,
            None => {
                run.state.status = FlowStatus::Terminated;
                Ok(run.finish())
            }
        }
    }

    /// 托管表单完成回调
    async fn complete_form(
        &self,
        event: &InboundEvent,
        completion: &FormCompletion,
        existing: Option<ContactFlowState>,
    ) -> Result<(EventOutcome, Persist)> {
        let flow = existing
            .as_ref()
            .and_then(|state| self.flows.get(&state.flow_name));
        let disposition = suspension::disposition(
            existing.as_ref(),
            flow.as_deref(),
            &completion.correlation_token,
        );
        self.store
            .record_suspension(SuspensionRecord::new(
                &event.contact_id,
                &completion.correlation_token,
                SuspensionKind::HostedForm,
                serde_json::to_value(completion)?,
                disposition,
            ))
            .await?;

        let (mut state, flow) = match (existing, flow) {
            (Some(state), Some(flow)) if disposition.applied() => (state, flow),
            (existing, _) => {
                warn!(
                    contact = %event.contact_id,
                    token = %completion.correlation_token,
                    disposition = ?disposition,
                    "late or mismatched form completion discarded"
                );
                let mut outcome = EventOutcome::new(&event.contact_id, EventDisposition::Discarded);
                if let Some(state) = &existing {
                    describe(&mut outcome, state);
                }
                return Ok((outcome, Persist::Unchanged));
            }
        };

        let namespace = match flow.step(&state.current_step).map(|step| &step.kind) {
            Some(StepKind::ExternalForm(form)) => form.response_namespace.clone(),
            _ => None,
        }
        .unwrap_or_else(|| self.settings.form_response_namespace.clone());
        info!(
            contact = %event.contact_id,
            flow = %state.flow_name,
            step = %state.current_step,
            fields = completion.field_values.len(),
            "form completion applied"
        );
        suspension::apply_completion(&mut state.context, &namespace, &completion.field_values);
        record_event(&mut state, event);

        let step = state.current_step.clone();
        let run = Run::new(state, flow, event);
        self.drive(run, Next::Evaluate(step)).await
    }

    /// 推进循环：自动串联非等待步骤，直到等待、结束或中止
    async fn drive(&self, mut run: Run<'_>, mut next: Next) -> Result<(EventOutcome, Persist)> {
        loop {
            next = match next {
                Next::Stop => break,
                Next::Enter(name) => self.enter(&mut run, name).await?,
                Next::Evaluate(name) => self.evaluate(&mut run, &name),
            };
        }
        Ok(run.finish())
    }

    async fn enter(&self, run: &mut Run<'_>, name: String) -> Result<Next> {
        let budget = self.settings.step_budget;
        if run.outcome.steps_entered >= budget {
            error!(
                contact = %run.state.contact_id,
                flow = %run.state.flow_name,
                step = %name,
                budget,
                "step budget exceeded, cycle detected in flow definition"
            );
            let reason = HaltReason::StepBudgetExceeded { step: name, budget };
            return Ok(run.halt(reason, &self.settings.generic_error_text));
        }

        let flow = Arc::clone(&run.flow);
        let Some(step) = flow.step(&name) else {
            error!(contact = %run.state.contact_id, flow = %flow.name, step = %name, "unknown step");
            return Ok(run.halt(HaltReason::UnknownStep { step: name }, &self.settings.generic_error_text));
        };
        run.outcome.steps_entered += 1;
        run.state.current_step = name;
        run.state.status = FlowStatus::Running;
        debug!(
            contact = %run.state.contact_id,
            flow = %flow.name,
            step = %step.name,
            kind = step.kind.as_str(),
            "entering step"
        );

        match &step.kind {
            StepKind::Question(question) => {
                question::reset_retries(&mut run.state.context);
                run.state.status = FlowStatus::AwaitingInput;
                if let Some(prompt) = &question.prompt {
                    if let Err(next) = self.send_rendered(run, step, prompt) {
                        return Ok(next);
                    }
                }
                Ok(Next::Stop)
            }
            StepKind::Action(action) => self.run_actions(run, step, action).await,
            StepKind::SendMessage(message) => match self.send_rendered(run, step, message) {
                Ok(()) => Ok(Next::Evaluate(step.name.clone())),
                Err(next) => Ok(next),
            },
            StepKind::SwitchFlow(switch) => {
                let resolved = self
                    .renderer
                    .resolve(&Value::Object(switch.initial_context.clone()), &run.scope());
                match resolved {
                    Ok(Value::Object(initial)) => Ok(self.switch(
                        run,
                        FlowSwitchRequest {
                            target_flow: switch.target_flow.clone(),
                            initial_context: initial,
                        },
                    )),
                    Ok(_) => Ok(self.switch(
                        run,
                        FlowSwitchRequest {
                            target_flow: switch.target_flow.clone(),
                            initial_context: Map::new(),
                        },
                    )),
                    Err(err) => Ok(self.template_failed(run, step, err.to_string())),
                }
            }
            StepKind::ExternalForm(form) => {
                let pending = PendingForm::issue(
                    &mut run.state.context,
                    &run.state.contact_id,
                    &flow.name,
                    &step.name,
                    &form.form_id,
                );
                run.state.status = FlowStatus::AwaitingInput;
                let launch = MessageSpec::LaunchForm {
                    form_id: form.form_id.clone(),
                    correlation_token: pending.token,
                    body: form.body.clone(),
                    header: form.header.clone(),
                    footer: form.footer.clone(),
                    cta: form.cta.clone(),
                };
                match self.send_rendered(run, step, &launch) {
                    Ok(()) => Ok(Next::Stop),
                    Err(next) => Ok(next),
                }
            }
            StepKind::EndFlow(end) => {
                if let Some(message) = &end.message {
                    if let Err(next) = self.send_rendered(run, step, message) {
                        return Ok(next);
                    }
                }
                info!(contact = %run.state.contact_id, flow = %flow.name, step = %step.name, "flow ended");
                run.state.status = FlowStatus::Terminated;
                Ok(Next::Stop)
            }
        }
    }

    /// 渲染并发送；失败时返回中止动作
    fn send_rendered(
        &self,
        run: &mut Run<'_>,
        step: &Step,
        message: &MessageSpec,
    ) -> std::result::Result<(), Next> {
        let rendered = message.render(self.renderer, &run.scope());
        match rendered {
            Ok(message) => {
                run.send(message);
                Ok(())
            }
            Err(err) => Err(self.template_failed(run, step, err.to_string())),
        }
    }

    fn template_failed(&self, run: &mut Run<'_>, step: &Step, message: String) -> Next {
        error!(
            contact = %run.state.contact_id,
            flow = %run.state.flow_name,
            step = %step.name,
            error = %message,
            "template rendering failed"
        );
        let reason = HaltReason::TemplateFailed {
            step: step.name.clone(),
            message,
        };
        run.halt(reason, &self.settings.generic_error_text)
    }

    /// 顺序执行动作；每个结果的补丁立即生效，后续动作可见
    async fn run_actions(&self, run: &mut Run<'_>, step: &Step, action: &ActionStep) -> Result<Next> {
        let mut switch = None;
        for invocation in &action.actions {
            let failed = |message: String| HaltReason::ActionFailed {
                step: step.name.clone(),
                action: invocation.action_type.clone(),
                message,
            };
            let Some(handler) = self.actions.get(&invocation.action_type) else {
                error!(
                    contact = %run.state.contact_id,
                    flow = %run.state.flow_name,
                    step = %step.name,
                    action = %invocation.action_type,
                    "action not registered"
                );
                let reason = failed("action not registered".to_string());
                return Ok(run.halt(reason, &self.settings.generic_error_text));
            };

            let resolved = self
                .renderer
                .resolve(&Value::Object(invocation.params.clone()), &run.scope());
            let params = match resolved {
                Ok(Value::Object(params)) => params,
                Ok(_) => Map::new(),
                Err(err) => return Ok(self.template_failed(run, step, err.to_string())),
            };

            let call = ActionCall {
                action_type: &invocation.action_type,
                contact_id: &run.state.contact_id,
                contact_name: run.event.contact_name.as_deref(),
                flow: &run.state.flow_name,
                step: &step.name,
                context: &run.state.context,
                params,
                event: Some(run.event),
            };
            let executed = AssertUnwindSafe(handler.execute(call)).catch_unwind().await;
            let result = match executed {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    error!(
                        contact = %run.state.contact_id,
                        flow = %run.state.flow_name,
                        step = %step.name,
                        action = %invocation.action_type,
                        error = %err,
                        "action failed"
                    );
                    return Ok(run.halt(failed(err.to_string()), &self.settings.generic_error_text));
                }
                Err(_) => {
                    error!(
                        contact = %run.state.contact_id,
                        flow = %run.state.flow_name,
                        step = %step.name,
                        action = %invocation.action_type,
                        "action panicked"
                    );
                    let reason = failed("action handler panicked".to_string());
                    return Ok(run.halt(reason, &self.settings.generic_error_text));
                }
            };

            run.state.context.apply_patch(&result.context_patch);
            run.outcome.outbound.extend(result.outbound_intents);
            run.outcome.external_calls.extend(result.external_calls);
            if result.flow_switch.is_some() {
                switch = result.flow_switch;
            }
        }

        Ok(match switch {
            Some(request) => self.switch(run, request),
            None => Next::Evaluate(step.name.clone()),
        })
    }

    /// 切换到目标流程入口；初始上下文合并进现有上下文
    fn switch(&self, run: &mut Run<'_>, request: FlowSwitchRequest) -> Next {
        let Some(target) = self.flows.get(&request.target_flow) else {
            error!(
                contact = %run.state.contact_id,
                flow = %run.state.flow_name,
                target = %request.target_flow,
                "switch target flow not registered"
            );
            let reason = HaltReason::FlowNotFound {
                flow: request.target_flow,
            };
            return run.halt(reason, &self.settings.generic_error_text);
        };
        info!(
            contact = %run.state.contact_id,
            from = %run.state.flow_name,
            to = %target.name,
            "switching flow"
        );
        run.state.context.apply_patch(&request.initial_context);
        question::reset_retries(&mut run.state.context);
        run.state.flow_name = target.name.clone();
        run.state.flow_version = target.version;
        let entry = target.entry.clone();
        run.flow = target;
        Next::Enter(entry)
    }

    fn evaluate(&self, run: &mut Run<'_>, name: &str) -> Next {
        let flow = Arc::clone(&run.flow);
        let Some(step) = flow.step(name) else {
            let reason = HaltReason::UnknownStep {
                step: name.to_string(),
            };
            return run.halt(reason, &self.settings.generic_error_text);
        };
        let evaluator = ConditionEvaluator::new(self.renderer);
        let target = {
            let scope = run.scope();
            step.transitions
                .iter()
                .find(|transition| {
                    evaluator.evaluate(&transition.condition, &scope, Some(run.event))
                })
                .map(|transition| transition.target.clone())
        };
        match target {
            Some(target) => {
                debug!(
                    contact = %run.state.contact_id,
                    flow = %flow.name,
                    from = %step.name,
                    to = %target,
                    "transition matched"
                );
                Next::Enter(target)
            }
            None => {
                warn!(
                    contact = %run.state.contact_id,
                    flow = %flow.name,
                    step = %step.name,
                    "no matching transition"
                );
                let reason = HaltReason::NoMatchingTransition {
                    step: step.name.clone(),
                };
                run.halt(reason, &self.settings.generic_error_text)
            }
        }
    }
}
