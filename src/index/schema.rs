use serde_json::{json, Value};

use crate::config::AnalyzerProfile;

/// Settings and mapping used when the message index is created.
pub fn index_definition(analyzer: AnalyzerProfile) -> Value {
    let (settings, text_analyzer) = match analyzer {
        AnalyzerProfile::Standard => (json!({}), "standard"),
        AnalyzerProfile::Korean => (korean_analysis(), "korean_analyzer"),
    };

    let mut definition = json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0
        },
        "mappings": {
            "properties": {
                "message_id": { "type": "keyword" },
                "channel_id": { "type": "keyword" },
                "channel_name": { "type": "keyword" },
                "text": analysed_text(text_analyzer),
                "author_id": { "type": "keyword" },
                "author_username": { "type": "keyword" },
                "author_name": analysed_text(text_analyzer),
                "timestamp": { "type": "date" },
                "thread_id": { "type": "keyword" },
                "is_thread_reply": { "type": "boolean" },
                "url": { "type": "keyword" }
            }
        }
    });

    if let (Some(target), Some(extra)) = (
        definition["settings"].as_object_mut(),
        settings.as_object(),
    ) {
        target.extend(extra.clone());
    }

    definition
}

fn analysed_text(analyzer: &str) -> Value {
    json!({
        "type": "text",
        "analyzer": analyzer,
        "fields": {
            "raw": { "type": "keyword" }
        }
    })
}

// Nori: decompound mixed, reading forms, drop particles and endings.
fn korean_analysis() -> Value {
    json!({
        "analysis": {
            "tokenizer": {
                "korean_tokenizer": {
                    "type": "nori_tokenizer",
                    "decompound_mode": "mixed"
                }
            },
            "filter": {
                "korean_pos_filter": {
                    "type": "nori_part_of_speech",
                    "stoptags": [
                        "E", "IC", "J", "MAG", "MAJ", "MM", "SP", "SSC", "SSO",
                        "SC", "SE", "XPN", "XSA", "XSN", "XSV", "UNA", "NA", "VSV"
                    ]
                }
            },
            "analyzer": {
                "korean_analyzer": {
                    "type": "custom",
                    "tokenizer": "korean_tokenizer",
                    "filter": ["nori_readingform", "lowercase", "korean_pos_filter"]
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_mapping_types() {
        let def = index_definition(AnalyzerProfile::Standard);
        let props = &def["mappings"]["properties"];
        assert_eq!(props["message_id"]["type"], "keyword");
        assert_eq!(props["channel_name"]["type"], "keyword");
        assert_eq!(props["text"]["type"], "text");
        assert_eq!(props["text"]["analyzer"], "standard");
        assert_eq!(props["text"]["fields"]["raw"]["type"], "keyword");
        assert_eq!(props["timestamp"]["type"], "date");
        assert_eq!(props["is_thread_reply"]["type"], "boolean");
        assert_eq!(def["settings"]["number_of_shards"], 1);
        assert!(def["settings"].get("analysis").is_none());
    }

    #[test]
    fn korean_profile_adds_nori_analyzer() {
        let def = index_definition(AnalyzerProfile::Korean);
        assert_eq!(
            def["settings"]["analysis"]["tokenizer"]["korean_tokenizer"]["type"],
            "nori_tokenizer"
        );
        assert_eq!(def["settings"]["number_of_replicas"], 0);
        assert_eq!(
            def["mappings"]["properties"]["author_name"]["analyzer"],
            "korean_analyzer"
        );
    }
}
