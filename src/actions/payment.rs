// OTP 支付挂起适配器：initiated -> otp_sent -> {succeeded | failed -> 重试或取消}

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{root_of, ActionCall, ActionHandler, ActionResult, ExternalCallRequest};
use crate::error::{ChatFlowError, Result};
use crate::flow::constants::{context_keys, payment};
use crate::state::FlowContext;

static OTP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{4,6}$").unwrap_or_else(|_| unreachable!()));

/// 支付网关约定
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate(&self, request: &PaymentRequest) -> Result<InitiateOutcome>;
    async fn confirm(&self, otp_reference: &str, otp: &str) -> Result<ConfirmOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub destination: String,
    #[serde(default)]
    pub booking_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiateOutcome {
    OtpSent { otp_reference: String },
    Rejected { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Success { payment_reference: String },
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPhase {
    Initiated,
    OtpSent,
    Succeeded,
    Failed,
    Cancelled,
}

/// 保存在上下文 `_payment` 下的支付子状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentState {
    pub phase: PaymentPhase,
    #[serde(default)]
    pub otp_reference: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub destination: String,
    #[serde(default)]
    pub booking_reference: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub payment_reference: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PaymentState {
    pub fn from_context(context: &FlowContext) -> Option<Self> {
        let raw = context.get(context_keys::PAYMENT)?;
        serde_json::from_value(raw.clone()).ok()
    }

    pub fn is_awaiting_otp(&self) -> bool {
        self.phase == PaymentPhase::OtpSent
    }

    fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// 清除上一轮支付留下的哨兵变量
fn clear_sentinels(result: ActionResult) -> ActionResult {
    result
        .unset(payment::SUCCESS)
        .unset(payment::FAILED)
        .unset(payment::ATTEMPTS_EXHAUSTED)
        .unset(payment::ERROR_MESSAGE)
        .unset(context_keys::PAYMENT_CANCELLED)
}

/// 取消当前支付：写入取消标记并请求调用方撤销
///
/// 由取消关键字拦截与 `cancel_payment` 动作共用，不会调用确认接口。
pub fn cancel_patch(contact_id: &str, context: &FlowContext) -> Result<ActionResult> {
    let mut result = clear_sentinels(ActionResult::new())
        .set(context_keys::PAYMENT_CANCELLED, Value::Bool(true))
        .unset(payment::OTP_REFERENCE);
    if let Some(mut state) = PaymentState::from_context(context) {
        let otp_reference = state.otp_reference.clone();
        if matches!(state.phase, PaymentPhase::Initiated | PaymentPhase::OtpSent) {
            result = result.call(ExternalCallRequest::PaymentCancellation {
                contact_id: contact_id.to_string(),
                otp_reference,
            });
        }
        state.phase = PaymentPhase::Cancelled;
        result = result.set(context_keys::PAYMENT, state.to_value()?);
    }
    Ok(result)
}

/// `initiate_payment`：向网关发起支付并进入 otp_sent
pub struct InitiatePaymentAction {
    gateway: std::sync::Arc<dyn PaymentGateway>,
}

impl InitiatePaymentAction {
    pub fn new(gateway: std::sync::Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl ActionHandler for InitiatePaymentAction {
    fn name(&self) -> &'static str {
        "initiate_payment"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["initiate_omari_payment"]
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        let raw_amount = call.require_str("amount")?;
        let currency = call
            .opt_str("currency")
            .unwrap_or_else(|| payment::DEFAULT_CURRENCY.to_string());
        let destination = call.require_any_str(&["destination", "msisdn"])?;
        let booking_reference = call.opt_str("booking_reference");

        let amount = match Decimal::from_str(raw_amount.trim()) {
            Ok(amount) if amount > Decimal::ZERO => amount,
            _ => {
                return Ok(clear_sentinels(ActionResult::new())
                    .set(payment::FAILED, Value::Bool(true))
                    .set(
                        payment::ERROR_MESSAGE,
                        Value::from(format!("'{}' is not a valid amount.", raw_amount)),
                    ));
            }
        };

        let request = PaymentRequest {
            amount,
            currency: currency.clone(),
            destination: destination.clone(),
            booking_reference: booking_reference.clone(),
        };
        let mut state = PaymentState {
            phase: PaymentPhase::Initiated,
            otp_reference: None,
            amount,
            currency,
            destination,
            booking_reference,
            attempts: 0,
            payment_reference: None,
            last_error: None,
        };

        let result = clear_sentinels(ActionResult::new());
        match self.gateway.initiate(&request).await? {
            InitiateOutcome::OtpSent { otp_reference } => {
                info!(contact = call.contact_id, %amount, "payment initiated, otp sent");
                state.phase = PaymentPhase::OtpSent;
                state.otp_reference = Some(otp_reference.clone());
                Ok(result
                    .set(payment::OTP_REFERENCE, Value::from(otp_reference))
                    .set(context_keys::PAYMENT, state.to_value()?))
            }
            InitiateOutcome::Rejected { message } => {
                warn!(contact = call.contact_id, %message, "payment initiation rejected");
                state.phase = PaymentPhase::Failed;
                state.last_error = Some(message.clone());
                Ok(result
                    .unset(payment::OTP_REFERENCE)
                    .set(payment::FAILED, Value::Bool(true))
                    .set(payment::ERROR_MESSAGE, Value::from(message))
                    .set(context_keys::PAYMENT, state.to_value()?))
            }
        }
    }

    fn declared_writes(&self, _params: &Map<String, Value>) -> Vec<String> {
        vec![
            payment::OTP_REFERENCE.to_string(),
            payment::FAILED.to_string(),
            payment::ERROR_MESSAGE.to_string(),
            context_keys::PAYMENT.to_string(),
        ]
    }
}

/// `confirm_payment_otp`：提交 OTP；失败时保留 otp_sent 以便重试，超过次数后终止
pub struct ConfirmPaymentOtpAction {
    gateway: std::sync::Arc<dyn PaymentGateway>,
}

impl ConfirmPaymentOtpAction {
    pub fn new(gateway: std::sync::Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl ActionHandler for ConfirmPaymentOtpAction {
    fn name(&self) -> &'static str {
        "confirm_payment_otp"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["process_otp"]
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        let mut state = PaymentState::from_context(call.context)
            .filter(PaymentState::is_awaiting_otp)
            .ok_or_else(|| ChatFlowError::action(self.name(), "no payment is awaiting an OTP"))?;
        let otp_reference = state
            .otp_reference
            .clone()
            .ok_or_else(|| ChatFlowError::action(self.name(), "payment has no OTP reference"))?;
        let otp = call.opt_str("otp").unwrap_or_default();
        let max_attempts = call
            .opt_u32("max_attempts")
            .unwrap_or(payment::DEFAULT_MAX_ATTEMPTS)
            .max(1);

        let outcome = if OTP_PATTERN.is_match(otp.trim()) {
            self.gateway.confirm(&otp_reference, otp.trim()).await?
        } else {
            ConfirmOutcome::Failed {
                message: "The OTP should be 4 to 6 digits.".to_string(),
            }
        };

        let result = clear_sentinels(ActionResult::new());
        match outcome {
            ConfirmOutcome::Success { payment_reference } => {
                info!(contact = call.contact_id, %payment_reference, "payment confirmed");
                state.phase = PaymentPhase::Succeeded;
                state.payment_reference = Some(payment_reference.clone());
                state.last_error = None;
                Ok(result
                    .set(payment::SUCCESS, Value::Bool(true))
                    .set(payment::REFERENCE, Value::from(payment_reference))
                    .unset(payment::ATTEMPTS_REMAINING)
                    .set(context_keys::PAYMENT, state.to_value()?))
            }
            ConfirmOutcome::Failed { message } => {
                state.attempts += 1;
                state.last_error = Some(message.clone());
                let remaining = max_attempts.saturating_sub(state.attempts);
                warn!(
                    contact = call.contact_id,
                    attempts = state.attempts,
                    remaining,
                    "otp confirmation failed"
                );
                let result = result
                    .set(payment::ERROR_MESSAGE, Value::from(message))
                    .set(payment::ATTEMPTS_REMAINING, Value::from(remaining));
                if remaining == 0 {
                    state.phase = PaymentPhase::Failed;
                    Ok(result
                        .set(payment::ATTEMPTS_EXHAUSTED, Value::Bool(true))
                        .set(context_keys::PAYMENT, state.to_value()?))
                } else {
                    Ok(result
                        .set(payment::FAILED, Value::Bool(true))
                        .set(context_keys::PAYMENT, state.to_value()?))
                }
            }
        }
    }

    fn declared_writes(&self, _params: &Map<String, Value>) -> Vec<String> {
        [
            payment::SUCCESS,
            payment::FAILED,
            payment::ATTEMPTS_EXHAUSTED,
            payment::REFERENCE,
            payment::ERROR_MESSAGE,
            payment::ATTEMPTS_REMAINING,
            context_keys::PAYMENT,
        ]
        .iter()
        .map(|key| root_of(key))
        .collect()
    }
}

/// `cancel_payment`
pub struct CancelPaymentAction;

#[async_trait]
impl ActionHandler for CancelPaymentAction {
    fn name(&self) -> &'static str {
        "cancel_payment"
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        cancel_patch(call.contact_id, call.context)
    }

    fn declared_writes(&self, _params: &Map<String, Value>) -> Vec<String> {
        vec![
            context_keys::PAYMENT_CANCELLED.to_string(),
            context_keys::PAYMENT.to_string(),
        ]
    }
}

/// 沙箱网关：固定 OTP 通过，记录调用次数
pub struct SandboxPaymentGateway {
    approved_otp: String,
    reject_initiation: bool,
    initiations: AtomicUsize,
    confirmations: AtomicUsize,
}

impl SandboxPaymentGateway {
    pub fn new(approved_otp: impl Into<String>) -> Self {
        Self {
            approved_otp: approved_otp.into(),
            reject_initiation: false,
            initiations: AtomicUsize::new(0),
            confirmations: AtomicUsize::new(0),
        }
    }

    /// 所有发起请求都被拒绝
    pub fn rejecting() -> Self {
        Self {
            reject_initiation: true,
            ..Self::default()
        }
    }

    pub fn initiations(&self) -> usize {
        self.initiations.load(Ordering::SeqCst)
    }

    pub fn confirmations(&self) -> usize {
        self.confirmations.load(Ordering::SeqCst)
    }
}

impl Default for SandboxPaymentGateway {
    fn default() -> Self {
        Self::new("123456")
    }
}

#[async_trait]
impl PaymentGateway for SandboxPaymentGateway {
    async fn initiate(&self, request: &PaymentRequest) -> Result<InitiateOutcome> {
        let count = self.initiations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_initiation {
            return Ok(InitiateOutcome::Rejected {
                message: format!("Payments to {} are unavailable.", request.destination),
            });
        }
        Ok(InitiateOutcome::OtpSent {
            otp_reference: format!("OTP-{:04}", count),
        })
    }

    async fn confirm(&self, otp_reference: &str, otp: &str) -> Result<ConfirmOutcome> {
        let count = self.confirmations.fetch_add(1, Ordering::SeqCst) + 1;
        if otp == self.approved_otp {
            Ok(ConfirmOutcome::Success {
                payment_reference: format!("PAY-{}-{}", otp_reference, count),
            })
        } else {
            Ok(ConfirmOutcome::Failed {
                message: "The OTP you entered is incorrect or has expired.".to_string(),
            })
        }
    }
}
