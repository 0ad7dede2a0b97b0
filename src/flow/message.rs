use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::template::{RenderScope, Renderer};

/// 与传输层无关的出站消息描述，所有字符串字段都是模板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum MessageSpec {
    Text {
        body: String,
        #[serde(default)]
        preview_url: bool,
    },
    Buttons {
        body: String,
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        footer: Option<String>,
        buttons: Vec<ButtonSpec>,
    },
    List {
        body: String,
        button_text: String,
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        footer: Option<String>,
        sections: Vec<ListSection>,
    },
    Document {
        url: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        caption: Option<String>,
    },
    Image {
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },
    /// 请求传输层拉起托管表单
    LaunchForm {
        form_id: String,
        #[serde(default)]
        correlation_token: String,
        body: String,
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        footer: Option<String>,
        cta: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonSpec {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl MessageSpec {
    pub fn text(body: impl Into<String>) -> Self {
        MessageSpec::Text {
            body: body.into(),
            preview_url: false,
        }
    }

    /// 渲染所有模板字段，返回新的消息
    pub fn render(&self, renderer: &Renderer, scope: &RenderScope<'_>) -> Result<MessageSpec> {
        let r = |raw: &String| renderer.render(raw, scope);
        let r_opt = |raw: &Option<String>| raw.as_ref().map(|raw| renderer.render(raw, scope)).transpose();

        Ok(match self {
            MessageSpec::Text { body, preview_url } => MessageSpec::Text {
                body: r(body)?,
                preview_url: *preview_url,
            },
            MessageSpec::Buttons {
                body,
                header,
                footer,
                buttons,
            } => MessageSpec::Buttons {
                body: r(body)?,
                header: r_opt(header)?,
                footer: r_opt(footer)?,
                buttons: buttons
                    .iter()
                    .map(|button| {
                        Ok(ButtonSpec {
                            id: r(&button.id)?,
                            title: r(&button.title)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            },
            MessageSpec::List {
                body,
                button_text,
                header,
                footer,
                sections,
            } => MessageSpec::List {
                body: r(body)?,
                button_text: r(button_text)?,
                header: r_opt(header)?,
                footer: r_opt(footer)?,
                sections: sections
                    .iter()
                    .map(|section| {
                        Ok(ListSection {
                            title: r(&section.title)?,
                            rows: section
                                .rows
                                .iter()
                                .map(|row| {
                                    Ok(ListRow {
                                        id: r(&row.id)?,
                                        title: r(&row.title)?,
                                        description: r_opt(&row.description)?,
                                    })
                                })
                                .collect::<Result<Vec<_>>>()?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            },
            MessageSpec::Document {
                url,
                filename,
                caption,
            } => MessageSpec::Document {
                url: r(url)?,
                filename: r_opt(filename)?,
                caption: r_opt(caption)?,
            },
            MessageSpec::Image { url, caption } => MessageSpec::Image {
                url: r(url)?,
                caption: r_opt(caption)?,
            },
            MessageSpec::LaunchForm {
                form_id,
                correlation_token,
                body,
                header,
                footer,
                cta,
            } => MessageSpec::LaunchForm {
                form_id: form_id.clone(),
                correlation_token: correlation_token.clone(),
                body: r(body)?,
                header: r_opt(header)?,
                footer: r_opt(footer)?,
                cta: r(cta)?,
            },
        })
    }

    /// 所有模板字段，供语法检查与静态分析
    pub fn templates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        match self {
            MessageSpec::Text { body, .. } => out.push(body),
            MessageSpec::Buttons {
                body,
                header,
                footer,
                buttons,
            } => {
                out.push(body);
                out.extend(header.as_deref());
                out.extend(footer.as_deref());
                for button in buttons {
                    out.push(&button.id);
                    out.push(&button.title);
                }
            }
            MessageSpec::List {
                body,
                button_text,
                header,
                footer,
                sections,
            } => {
                out.push(body);
                out.push(button_text);
                out.extend(header.as_deref());
                out.extend(footer.as_deref());
                for section in sections {
                    out.push(&section.title);
                    for row in &section.rows {
                        out.push(&row.id);
                        out.push(&row.title);
                        out.extend(row.description.as_deref());
                    }
                }
            }
            MessageSpec::Document {
                url,
                filename,
                caption,
            } => {
                out.push(url);
                out.extend(filename.as_deref());
                out.extend(caption.as_deref());
            }
            MessageSpec::Image { url, caption } => {
                out.push(url);
                out.extend(caption.as_deref());
            }
            MessageSpec::LaunchForm {
                body,
                header,
                footer,
                cta,
                ..
            } => {
                out.push(body);
                out.extend(header.as_deref());
                out.extend(footer.as_deref());
                out.push(cta);
            }
        }
        out
    }
}
