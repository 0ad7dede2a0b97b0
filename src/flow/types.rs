use std::collections::HashMap;

use super::conditions::Condition;
use super::steps::StepKind;

/// Flow 核心类型定义

/// 加载后不可变的流程图
#[derive(Debug, Clone)]
pub struct Flow {
    pub name: String,
    pub friendly_name: Option<String>,
    pub description: Option<String>,
    pub version: u32,
    /// 已转为小写并去除空白
    pub trigger_keywords: Vec<String>,
    pub active: bool,
    pub entry: String,
    pub context_inputs: Vec<String>,
    pub steps: HashMap<String, Step>,
    /// 步骤声明顺序
    pub order: Vec<String>,
}

impl Flow {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    pub fn entry_step(&self) -> Option<&Step> {
        self.steps.get(&self.entry)
    }

    /// 按声明顺序遍历步骤
    pub fn steps_in_order(&self) -> impl Iterator<Item = &Step> {
        self.order.iter().filter_map(|name| self.steps.get(name))
    }

    pub fn matches_trigger(&self, text: &str) -> bool {
        let text = text.trim().to_lowercase();
        !text.is_empty() && self.trigger_keywords.iter().any(|keyword| *keyword == text)
    }
}

/// 流程中的单个步骤
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub is_entry: bool,
    pub kind: StepKind,
    /// 已按优先级稳定排序
    pub transitions: Vec<Transition>,
}

/// Flow 转换
#[derive(Debug, Clone)]
pub struct Transition {
    pub target: String,
    pub condition: Condition,
    pub priority: i32,
}
