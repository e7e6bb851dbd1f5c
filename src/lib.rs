pub mod core;
pub mod storage;
pub mod mmap;
pub mod index;
pub mod parallel;
pub mod writer;

/*
┌──────────────────────────────────────────────────────────────────────────────┐
│                            MBOXDEX ARCHITECTURE                              │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── CORE LAYER ──────────────────────────────────┐
│  struct Engine                                                               │
│  ┌────────────────────────────────────────────────────────────────────────┐  │
│  │ config: Config                 // Paths, workers, flush ceilings       │  │
│  │ storage: Arc<StorageLayout>    // Every on-disk path                   │  │
│  │ index: Arc<OffsetIndex>        // record_id -> (offset, length)        │  │
│  │ groups: Arc<GroupIndex>        // group key -> ids, O(1)               │  │
│  │ processor: ParallelProcessor   // Bounded worker pool                  │  │
│  └────────────────────────────────────────────────────────────────────────┘  │
└──────────────────────────────────────────────────────────────────────────────┘
                                      │
                                      ▼
┌──────────────────────────────── INDEX LAYER ─────────────────────────────────┐
│  OffsetIndexBuilder ── scan (single pass, mmap) ──► OffsetIndex (.idx)       │
│       │  scanner::scan_records         extractor::AttributeExtractor         │
│       ▼                                                                      │
│  GroupIndexBuilder ── fold entries ──► GroupIndex (.idx.groups)              │
│                                                                              │
│  File format: [magic 8][version u32][len u64][crc32 u32][bincode body]       │
│  Written to a temp file, fsynced, renamed. Build guarded by flock.           │
└──────────────────────────────────────────────────────────────────────────────┘
                                      │
                                      ▼
┌─────────────────────────────── PARALLEL LAYER ───────────────────────────────┐
│  WorkDistributor::partition(balanced | locality) ──► Vec<WorkBatch>          │
│                                                                              │
│  ParallelProcessor (rayon pool, one task per batch)                          │
│   ┌──────────────┐  ┌──────────────┐        ┌──────────────┐                 │
│   │ worker 0     │  │ worker 1     │  ...   │ worker N-1   │                 │
│   │ RecordView   │  │ RecordView   │        │ RecordView   │  zero-copy      │
│   │ transform()  │  │ transform()  │        │ transform()  │                 │
│   └──────┬───────┘  └──────┬───────┘        └──────┬───────┘                 │
│          │  BatchReport over crossbeam channel     │                         │
│          └─────────────────┬───────────────────────┘                         │
└────────────────────────────┼─────────────────────────────────────────────────┘
                             ▼  ResultSink::queue
┌──────────────────────────────── WRITER LAYER ────────────────────────────────┐
│  BatchWriter                                                                 │
│   buffer: Mutex<OutputBuffer>          // append + flush decision only       │
│   store:  Mutex<Box<dyn MetadataStore>> // serialises flush I/O              │
│                                                                              │
│   flush ──► ArtifactLayout::artifact_path(id) ──► fs::write (overwrite)      │
│         └─► MetadataStore::upsert_batch(rows)  (one bulk upsert)             │
└──────────────────────────────────────────────────────────────────────────────┘
*/
