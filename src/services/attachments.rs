//! Text descriptors for files attached to a message.
//!
//! Binary content never leaves the client: every attachment is reduced to a
//! block of text appended to the user's message. Plain-text and CSV files
//! carry their raw contents; everything else is described by name, type and
//! size together with guidance for the assistant.

use crate::models::Attachment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Text,
    Csv,
    Pdf,
    Image,
    Spreadsheet,
    Document,
    Presentation,
    Other,
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "json", "xml", "html", "htm", "log", "yaml", "yml", "tsv",
];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "heic"];
const SPREADSHEET_EXTENSIONS: &[&str] = &["xls", "xlsx", "ods"];
const DOCUMENT_EXTENSIONS: &[&str] = &["doc", "docx", "odt", "rtf"];
const PRESENTATION_EXTENSIONS: &[&str] = &["ppt", "pptx", "odp"];

impl AttachmentKind {
    /// Classify by MIME type first, then by file extension.
    pub fn classify(attachment: &Attachment) -> Self {
        let mime = attachment.mime_type.to_ascii_lowercase();
        let ext = attachment.extension().unwrap_or_default();
        let has_ext = |list: &[&str]| list.contains(&ext.as_str());

        if mime == "text/csv" || ext == "csv" {
            AttachmentKind::Csv
        } else if mime == "application/pdf" || ext == "pdf" {
            AttachmentKind::Pdf
        } else if mime.starts_with("image/") || has_ext(IMAGE_EXTENSIONS) {
            AttachmentKind::Image
        } else if mime.contains("spreadsheet") || mime.contains("ms-excel") || has_ext(SPREADSHEET_EXTENSIONS) {
            AttachmentKind::Spreadsheet
        } else if mime.contains("presentation") || mime.contains("ms-powerpoint") || has_ext(PRESENTATION_EXTENSIONS) {
            AttachmentKind::Presentation
        } else if mime.contains("wordprocessing") || mime == "application/msword" || has_ext(DOCUMENT_EXTENSIONS) {
            AttachmentKind::Document
        } else if mime.starts_with("text/") || mime == "application/json" || has_ext(TEXT_EXTENSIONS) {
            AttachmentKind::Text
        } else {
            AttachmentKind::Other
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AttachmentKind::Text => "ARQUIVO DE TEXTO",
            AttachmentKind::Csv => "PLANILHA CSV",
            AttachmentKind::Pdf => "DOCUMENTO PDF",
            AttachmentKind::Image => "IMAGEM",
            AttachmentKind::Spreadsheet => "PLANILHA",
            AttachmentKind::Document => "DOCUMENTO",
            AttachmentKind::Presentation => "APRESENTAÇÃO",
            AttachmentKind::Other => "ARQUIVO",
        }
    }

    fn instructions(&self) -> &'static str {
        match self {
            AttachmentKind::Text => "Analise o conteúdo do arquivo acima para responder ao usuário.",
            AttachmentKind::Csv => {
                "Os dados acima estão em formato CSV. Interprete as colunas e linhas, \
                 identifique padrões e responda com base nesses dados."
            }
            AttachmentKind::Pdf => {
                "O usuário enviou um PDF cujo conteúdo não foi extraído. Pergunte quais \
                 trechos ou informações ele deseja discutir, ou peça que cole o texto relevante."
            }
            AttachmentKind::Image => {
                "O usuário enviou uma imagem. Você não consegue vê-la: peça uma descrição \
                 (espécie, local, características) para ajudar na identificação."
            }
            AttachmentKind::Spreadsheet => {
                "O usuário enviou uma planilha. Peça que exporte os dados como CSV ou \
                 descreva as colunas para que você possa analisá-los."
            }
            AttachmentKind::Document => {
                "O usuário enviou um documento de texto. Peça que cole os trechos \
                 relevantes para que você possa analisá-los."
            }
            AttachmentKind::Presentation => {
                "O usuário enviou uma apresentação. Peça que descreva os slides ou cole \
                 o texto relevante."
            }
            AttachmentKind::Other => {
                "Tipo de arquivo não suportado para leitura. Pergunte ao usuário como \
                 você pode ajudar com este arquivo."
            }
        }
    }

    fn includes_raw_text(&self) -> bool {
        matches!(self, AttachmentKind::Text | AttachmentKind::Csv)
    }
}

/// Human-readable size, e.g. `512 B`, `2.0 KB`, `1.5 MB`.
pub fn format_size(bytes: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < MB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{:.1} MB", b / MB)
    }
}

pub fn describe(attachment: &Attachment) -> String {
    let kind = AttachmentKind::classify(attachment);
    let label = kind.label();
    let mut block = format!("=== {}: {} ===\n", label, attachment.filename);

    if kind.includes_raw_text() {
        let text = String::from_utf8_lossy(&attachment.data);
        block.push_str(&text);
        if !text.ends_with('\n') {
            block.push('\n');
        }
        block.push_str(&format!("=== FIM DA {} ===\n", label));
    } else {
        block.push_str(&format!("Tipo: {}\n", attachment.mime_type));
        block.push_str(&format!("Tamanho: {}\n", format_size(attachment.size())));
    }

    block.push_str(kind.instructions());
    block
}

/// Append one descriptor block per attachment to the user's text.
pub fn augment_content(content: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return content.to_string();
    }
    let blocks: Vec<String> = attachments.iter().map(describe).collect();
    format!("{}\n\n{}", content, blocks.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, mime: &str, data: &[u8]) -> Attachment {
        Attachment::new(name, mime, data.to_vec())
    }

    #[test]
    fn test_classification() {
        let cases = [
            (file("notes.txt", "text/plain", b""), AttachmentKind::Text),
            (file("dados.csv", "text/csv", b""), AttachmentKind::Csv),
            (file("dados.CSV", "application/octet-stream", b""), AttachmentKind::Csv),
            (file("artigo.pdf", "application/pdf", b""), AttachmentKind::Pdf),
            (file("onca.jpg", "image/jpeg", b""), AttachmentKind::Image),
            (file("censo.xlsx", "", b""), AttachmentKind::Spreadsheet),
            (file("relatorio.docx", "", b""), AttachmentKind::Document),
            (file("aula.pptx", "", b""), AttachmentKind::Presentation),
            (file("arquivo.zip", "application/zip", b""), AttachmentKind::Other),
            (file("sem_extensao", "", b""), AttachmentKind::Other),
        ];
        for (attachment, expected) in cases {
            assert_eq!(
                AttachmentKind::classify(&attachment),
                expected,
                "{}",
                attachment.filename
            );
        }
    }

    #[test]
    fn test_csv_block_carries_raw_text() {
        let csv = file("especies.csv", "text/csv", b"especie,bioma\nonca,pantanal\n");
        let content = augment_content("Analyze this", &[csv]);

        assert!(content.starts_with("Analyze this"));
        assert!(content.contains("=== PLANILHA CSV: especies.csv ===\nespecie,bioma\nonca,pantanal\n"));
        assert!(content.contains("=== FIM DA PLANILHA CSV ==="));
    }

    #[test]
    fn test_raw_text_kept_verbatim() {
        let block = describe(&file("notas.txt", "text/plain", b"linha 1  \n\n\t"));
        assert!(block.contains("=== ARQUIVO DE TEXTO: notas.txt ===\nlinha 1  \n\n\t\n=== FIM DA ARQUIVO DE TEXTO ==="));

        let block = describe(&file("a.csv", "text/csv", b"x,y\n"));
        assert!(block.contains("x,y\n=== FIM DA PLANILHA CSV ==="));
    }

    #[test]
    fn test_binary_block_describes_only() {
        let pdf = file("artigo.pdf", "application/pdf", &[0x25, 0x50, 0x44, 0x46]);
        let block = describe(&pdf);

        assert!(block.starts_with("=== DOCUMENTO PDF: artigo.pdf ==="));
        assert!(block.contains("Tipo: application/pdf"));
        assert!(block.contains("Tamanho: 4 B"));
        assert!(!block.contains("%PDF"));
    }

    #[test]
    fn test_no_attachments_leaves_content() {
        assert_eq!(augment_content("What is a jaguar?", &[]), "What is a jaguar?");
    }

    #[test]
    fn test_multiple_blocks_in_order() {
        let content = augment_content(
            "Veja",
            &[
                file("a.txt", "text/plain", b"alpha"),
                file("b.png", "image/png", b"\x89PNG"),
            ],
        );
        let text_pos = content.find("=== ARQUIVO DE TEXTO: a.txt ===").unwrap();
        let image_pos = content.find("=== IMAGEM: b.png ===").unwrap();
        assert!(text_pos < image_pos);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024 / 2), "1.5 MB");
    }
}
