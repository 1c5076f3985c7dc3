#[derive(Debug, Clone)]
pub struct TestCase {
    name: &'static str,
    group: TestGroup,
    body: TestBody,
}

impl TestCase {
    pub fn new(name: &'static str, group: TestGroup, body: TestBody) -> Self {
        Self { name, group, body }
    }

    pub fn small(name: &'static str, body: TestBody) -> Self {
        Self::new(name, TestGroup::Small, body)
    }

    pub fn large(name: &'static str, body: TestBody) -> Self {
        Self::new(name, TestGroup::Large, body)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn group(&self) -> TestGroup {
        self.group
    }

    pub fn body(&self) -> &TestBody {
        &self.body
    }
}

/// A generated `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct TestBody {
    boundary: &'static str,
    content: Vec<u8>,
}

impl TestBody {
    pub fn builder(boundary: &'static str) -> TestBodyBuilder {
        TestBodyBuilder { boundary, content: Vec::new() }
    }

    pub fn boundary(&self) -> &'static str {
        self.boundary
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

#[derive(Debug)]
pub struct TestBodyBuilder {
    boundary: &'static str,
    content: Vec<u8>,
}

impl TestBodyBuilder {
    #[must_use]
    pub fn field(mut self, name: &str, value: &str) -> Self {
        let boundary = self.boundary;
        self.content.extend_from_slice(
            format!("--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
        );
        self
    }

    /// Adds a file part filled with `size` bytes of a repeating pattern.
    #[must_use]
    pub fn file(mut self, name: &str, file_name: &str, size: usize) -> Self {
        let boundary = self.boundary;
        self.content.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        self.content.extend(b"0123456789abcdef\r\n-".iter().copied().cycle().take(size));
        self.content.extend_from_slice(b"\r\n");
        self
    }

    pub fn build(mut self) -> TestBody {
        self.content.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        TestBody { boundary: self.boundary, content: self.content }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum TestGroup {
    Small,
    Large,
}
