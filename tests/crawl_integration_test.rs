//! 爬取集成测试：BFS 边界、环形链接、重建、失败策略、并发保护

mod common;

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use parley::core::CrawlError;
    use parley::knowledge::{Chunker, ChunkingConfig, CrawlParams, Crawler, DocumentChunk, SemanticIndex, SqliteIndex};
    use parley::llm::HashingEmbedder;
    use parley::store::{connect, ConnectOptions, CrawlStatus, StoreHandles};
    use tokio_util::sync::CancellationToken;

    use crate::common::FakeSite;

    struct Harness {
        store: StoreHandles,
        index: Arc<SqliteIndex>,
        site: Arc<FakeSite>,
        crawler: Arc<Crawler>,
    }

    async fn harness(site: FakeSite) -> Harness {
        let store = connect(&ConnectOptions::new("sqlite::memory:")).await.unwrap();
        let index = Arc::new(SqliteIndex::new(store.pool().clone()));
        let site = Arc::new(site);
        let crawler = Arc::new(Crawler::new(
            site.clone(),
            Arc::new(HashingEmbedder::default()),
            index.clone(),
            store.checkpoints.clone(),
            Chunker::new(ChunkingConfig {
                chunk_size: 200,
                chunk_overlap: 20,
            }),
        ));
        Harness {
            store,
            index,
            site,
            crawler,
        }
    }

    fn params(start_url: &str, max_pages: usize, rebuild: bool) -> CrawlParams {
        CrawlParams {
            start_url: start_url.to_string(),
            max_pages,
            delay: Duration::ZERO,
            rebuild,
        }
    }

    async fn indexed_urls(index: &SqliteIndex) -> HashSet<String> {
        index.keys().await.unwrap().into_iter().map(|(url, _)| url).collect()
    }

    fn three_page_site() -> FakeSite {
        FakeSite::new()
            .page("https://site.test/1", "Page one talks about the tokio runtime.", &["/2", "/3"])
            .page("https://site.test/2", "Page two covers sqlite storage.", &["/1"])
            .page("https://site.test/3", "Page three is about crawling.", &["/1"])
    }

    #[tokio::test]
    async fn test_max_pages_bounds_visited_and_indexed() {
        let h = harness(three_page_site()).await;
        let report = h
            .crawler
            .run(params("https://site.test/1", 2, false), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report.visited,
            vec!["https://site.test/1".to_string(), "https://site.test/2".to_string()]
        );
        assert_eq!(report.pages_crawled, 2);
        assert_eq!(
            indexed_urls(&h.index).await,
            HashSet::from(["https://site.test/1".to_string(), "https://site.test/2".to_string()])
        );

        let checkpoint = h.store.checkpoints.load().await.unwrap();
        assert_eq!(checkpoint.status, CrawlStatus::Success);
        assert_eq!(checkpoint.pages_crawled, 2);
        assert!(checkpoint.last_crawl_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_link_cycles_fetch_each_url_once() {
        let site = FakeSite::new()
            .page("https://site.test/", "home", &["/a", "/b#top", "/", "https://site.test/a"])
            .page("https://site.test/a", "a", &["/b", "/", "/a#x"])
            .page("https://site.test/b", "b", &["/a", "https://other.test/", "/logo.png"]);
        let h = harness(site).await;

        let report = h
            .crawler
            .run(params("https://site.test/#intro", 50, false), CancellationToken::new())
            .await
            .unwrap();

        let fetched = h.site.fetches();
        let unique: HashSet<_> = fetched.iter().collect();
        assert_eq!(fetched.len(), unique.len(), "a URL was fetched twice: {:?}", fetched);
        assert_eq!(fetched.len(), 3);
        assert_eq!(report.visited.len(), 3);
        assert!(!fetched.iter().any(|u| u.contains("other.test") || u.ends_with(".png")));
    }

    #[tokio::test]
    async fn test_rebuild_leaves_only_this_runs_chunks() {
        let h = harness(three_page_site()).await;
        h.index
            .upsert(&DocumentChunk {
                source_url: "https://site.test/removed".to_string(),
                chunk_index: 0,
                text: "stale".to_string(),
                embedding: vec![1.0; 256],
            })
            .await
            .unwrap();

        h.crawler
            .run(params("https://site.test/1", 10, true), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            indexed_urls(&h.index).await,
            HashSet::from([
                "https://site.test/1".to_string(),
                "https://site.test/2".to_string(),
                "https://site.test/3".to_string(),
            ])
        );
    }

    #[tokio::test]
    async fn test_incremental_crawl_prunes_stale_chunks_of_shrunk_page() {
        let long_text = "alpha beta gamma delta ".repeat(40);
        let h = harness(FakeSite::new().page("https://site.test/doc", &long_text, &[])).await;
        h.crawler
            .run(params("https://site.test/doc", 5, false), CancellationToken::new())
            .await
            .unwrap();
        let before = h.index.keys().await.unwrap().len();
        assert!(before > 1);

        // 同一页面变短后再爬（非重建）
        let recrawler = Crawler::new(
            Arc::new(FakeSite::new().page("https://site.test/doc", "short now", &[])),
            Arc::new(HashingEmbedder::default()),
            h.index.clone(),
            h.store.checkpoints.clone(),
            Chunker::new(ChunkingConfig {
                chunk_size: 200,
                chunk_overlap: 20,
            }),
        );
        recrawler
            .run(params("https://site.test/doc", 5, false), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            h.index.keys().await.unwrap(),
            vec![("https://site.test/doc".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_failed_pages_are_skipped_and_counted() {
        let site = three_page_site().failing("https://site.test/2");
        let h = harness(site).await;
        let report = h
            .crawler
            .run(params("https://site.test/1", 10, false), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.visited.len(), 3);
        assert_eq!(report.pages_crawled, 2);
        assert_eq!(report.failed_pages, 1);
        let checkpoint = h.store.checkpoints.load().await.unwrap();
        assert_eq!(checkpoint.status, CrawlStatus::Success);
        assert_eq!(checkpoint.pages_crawled, 2);
    }

    #[tokio::test]
    async fn test_nothing_fetched_marks_failed() {
        let h = harness(FakeSite::new()).await;
        let err = h
            .crawler
            .run(params("https://site.test/missing", 10, false), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::NothingFetched));

        let checkpoint = h.store.checkpoints.load().await.unwrap();
        assert_eq!(checkpoint.status, CrawlStatus::Failed);
        assert_eq!(checkpoint.pages_crawled, 0);
        assert!(checkpoint.error_message.is_some());
    }

    #[tokio::test]
    async fn test_invalid_start_url_marks_failed() {
        let h = harness(FakeSite::new()).await;
        let err = h
            .crawler
            .run(params("ftp://site.test/", 10, false), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidStartUrl(_)));
        assert_eq!(h.store.checkpoints.load().await.unwrap().status, CrawlStatus::Failed);
        assert_eq!(h.site.total_fetches(), 0);
    }

    #[tokio::test]
    async fn test_reservation_blocks_other_crawls_until_released() {
        let h = harness(three_page_site()).await;
        let permit = h.crawler.try_reserve().unwrap();
        assert!(h.crawler.is_running());
        assert!(matches!(h.crawler.try_reserve(), Err(CrawlError::AlreadyRunning)));
        assert!(matches!(
            h.crawler.spawn(params("https://site.test/1", 10, false), CancellationToken::new()),
            Err(CrawlError::AlreadyRunning)
        ));
        assert_eq!(h.store.checkpoints.load().await.unwrap().status, CrawlStatus::Idle);

        // 名额交给任务，任务结束后释放
        let started_at = chrono::Utc::now();
        let handle = h.crawler.spawn_reserved(
            permit,
            params("https://site.test/1", 10, false),
            CancellationToken::new(),
            started_at,
        );
        let report = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
        assert_eq!(report.pages_crawled, 3);
        assert!(!h.crawler.is_running());
        assert!(h.crawler.try_reserve().is_ok());

        let checkpoint = h.store.checkpoints.load().await.unwrap();
        assert_eq!(checkpoint.status, CrawlStatus::Success);
        assert_eq!(
            checkpoint.last_crawl_timestamp.map(|t| t.timestamp()),
            Some(started_at.timestamp())
        );
    }

    #[tokio::test]
    async fn test_second_crawl_rejected_and_cancellation_marks_failed() {
        let h = harness(three_page_site()).await;
        let stop = CancellationToken::new();
        let slow = CrawlParams {
            delay: Duration::from_secs(30),
            ..params("https://site.test/1", 10, false)
        };

        let handle = h.crawler.spawn(slow.clone(), stop.clone()).unwrap();
        assert!(h.crawler.is_running());
        assert!(matches!(
            h.crawler.spawn(slow.clone(), stop.clone()),
            Err(CrawlError::AlreadyRunning)
        ));
        assert!(matches!(
            h.crawler.run(slow, stop.clone()).await,
            Err(CrawlError::AlreadyRunning)
        ));

        // 等第一页抓完，进入礼貌间隔后取消
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.site.total_fetches() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        stop.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(CrawlError::Cancelled)));
        assert!(!h.crawler.is_running());

        let checkpoint = h.store.checkpoints.load().await.unwrap();
        assert_eq!(checkpoint.status, CrawlStatus::Failed);
        assert_eq!(checkpoint.pages_crawled, 1);
        assert!(checkpoint.error_message.unwrap().contains("cancelled"));
    }
}
