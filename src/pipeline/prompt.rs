//! Prompt templates for the answering model

use crate::types::QuestionRecord;

const RAG_TEMPLATE: &str = "
你是一个擅长回答问题的专家.
这是一些相关的资料: {reviews}
这是你要回答的问题: {question}
请基于以上资料和问题，从以下选项中选择一个最合适的答案: {options}
";

const PURE_TEMPLATE: &str = "
你是一个擅长回答问题的专家.
这是你要回答的问题: {question}
请基于以上问题，从以下选项中选择一个最合适的答案: {options}
";

/// Appended for hosted batch jobs where only the letter is scored
pub const LETTER_ONLY_INSTRUCTION: &str =
    "\n请直接给出正确选项的字母（A、B、C、D或E），不要输出任何解释。";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    /// Retrieved passages, question and options
    Rag,
    /// Question and options only
    Pure,
}

impl PromptTemplate {
    pub fn render(&self, record: &QuestionRecord, context: &str) -> String {
        let template = match self {
            PromptTemplate::Rag => RAG_TEMPLATE,
            PromptTemplate::Pure => PURE_TEMPLATE,
        };

        let options = record.options_text();
        let values = [("{reviews}", context), ("{question}", record.question.as_str()), ("{options}", options.as_str())];

        // single pass, so placeholders inside substituted text stay literal
        let mut rendered = String::with_capacity(template.len() + context.len() + record.question.len() + options.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            rendered.push_str(&rest[..start]);
            rest = &rest[start..];
            match values.iter().find(|(key, _)| rest.starts_with(key)) {
                Some((key, value)) => {
                    rendered.push_str(value);
                    rest = &rest[key.len()..];
                }
                None => {
                    rendered.push('{');
                    rest = &rest[1..];
                }
            }
        }
        rendered.push_str(rest);
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> QuestionRecord {
        serde_json::from_value(serde_json::json!({
            "question": "心肌梗死最常见的死亡原因是",
            "options": {"A": "心律失常", "B": "心力衰竭"},
            "answer_idx": "A",
        }))
        .unwrap()
    }

    #[test]
    fn test_rag_prompt_includes_context() {
        let prompt = PromptTemplate::Rag.render(&record(), "资料一\n资料二");
        assert!(prompt.contains("这是一些相关的资料: 资料一\n资料二"));
        assert!(prompt.contains("这是你要回答的问题: 心肌梗死最常见的死亡原因是"));
        assert!(prompt.contains("A. 心律失常\nB. 心力衰竭"));
    }

    #[test]
    fn test_pure_prompt_ignores_context() {
        let prompt = PromptTemplate::Pure.render(&record(), "资料一");
        assert!(!prompt.contains("资料一"));
        assert!(!prompt.contains("{reviews}"));
    }

    #[test]
    fn test_placeholders_in_inserted_text_stay_literal() {
        let mut question = record();
        question.question = "下列哪项不属于{reviews}".to_string();

        let prompt = PromptTemplate::Rag.render(&question, "资料中写有{question}和{options}");
        assert!(prompt.contains("这是一些相关的资料: 资料中写有{question}和{options}\n"));
        assert!(prompt.contains("这是你要回答的问题: 下列哪项不属于{reviews}\n"));
        assert!(prompt.contains("A. 心律失常"));
    }
}
