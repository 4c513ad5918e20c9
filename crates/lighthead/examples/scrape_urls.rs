//! Example: scrape a handful of URLs with a real browser
//!
//! Run with: cargo run -p lighthead --example scrape_urls
//!
//! Needs Chrome or Chromium installed (or `LIGHTHEAD_REMOTE_URL` set).

use lighthead::{scrape, ScrapeOptions, ScrapeResult};

struct Case {
    url: &'static str,
    description: &'static str,
    expect_kind: &'static str,
    expect_contains: Option<&'static str>,
}

const CASES: &[Case] = &[
    Case {
        url: "https://example.com",
        description: "Simple HTML page",
        expect_kind: "html",
        expect_contains: Some("Example Domain"),
    },
    Case {
        url: "https://httpbin.org/html",
        description: "HTML endpoint",
        expect_kind: "html",
        expect_contains: Some("Herman Melville"),
    },
    Case {
        url: "http://github.com",
        description: "Redirect to HTTPS",
        expect_kind: "html",
        expect_contains: None,
    },
    Case {
        url: "https://httpbin.org/image/png",
        description: "Binary image",
        expect_kind: "binary",
        expect_contains: None,
    },
];

#[tokio::main]
async fn main() {
    println!("Lighthead scrape examples");
    println!("=========================\n");

    let mut passed = 0;
    let mut failed = 0;

    for (i, case) in CASES.iter().enumerate() {
        println!("{}. {}", i + 1, case.description);
        println!("   URL: {}", case.url);

        match scrape(case.url, ScrapeOptions::default()).await {
            Ok(result) => {
                print_summary(&result);
                if check(case, &result) {
                    println!("   PASS\n");
                    passed += 1;
                } else {
                    println!("   FAIL (expectations not met)\n");
                    failed += 1;
                }
            }
            Err(e) => {
                println!("   Error: {}", e);
                println!("   FAIL\n");
                failed += 1;
            }
        }
    }

    println!("=========================");
    println!("Results: {} passed, {} failed", passed, failed);

    if failed > 0 {
        std::process::exit(1);
    }
}

fn print_summary(result: &ScrapeResult) {
    println!("   Status: {}", result.response().status);
    println!("   Type: {}", result.kind());
    if result.final_url() != result.url() {
        println!("   Final URL: {}", result.final_url());
    }
    for hop in result.redirect_chain() {
        println!("   Redirect: {} -> {} ({})", hop.from, hop.to, hop.status);
    }

    match result {
        ScrapeResult::Html(page) => {
            let preview: String = page.markdown.chars().take(100).collect();
            println!(
                "   Preview: {}{}",
                preview.replace('\n', " "),
                if page.markdown.chars().count() > 100 { "..." } else { "" }
            );
        }
        ScrapeResult::Binary(file) => {
            println!("   File: {} ({})", file.filename, file.content_type);
            println!("   Size: {} bytes", file.buffer.len());
        }
    }
}

fn check(case: &Case, result: &ScrapeResult) -> bool {
    if result.kind() != case.expect_kind {
        println!("   Expected {}, got {}", case.expect_kind, result.kind());
        return false;
    }

    if let (Some(expected), ScrapeResult::Html(page)) = (case.expect_contains, result) {
        if !page.markdown.contains(expected) {
            println!("   Expected markdown to contain '{}'", expected);
            return false;
        }
    }

    true
}
